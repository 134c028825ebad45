//! Peer registry: online peers keyed by remote uid.
//!
//! The [`PeerRegistry`] is a thread-safe map shared by the runtime's accept
//! and connect paths. A uid can be registered only once; a peer removes only
//! its own entry, so a late offline notification never evicts a newer
//! connection that reused the uid.

use crate::peer::Peer;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe registry of online peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, Arc<Peer>>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under its uid. Returns `false` if the uid is taken or
    /// the peer has no uid yet.
    pub fn add_peer(&self, peer: Arc<Peer>) -> bool {
        let Some(uid) = peer.uid() else {
            return false;
        };
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(&uid) {
            return false;
        }
        peers.insert(uid, peer);
        true
    }

    /// Remove `peer`'s entry if it is still the registered one.
    pub fn remove_peer(&self, peer: &Arc<Peer>) -> bool {
        let Some(uid) = peer.uid() else {
            return false;
        };
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get(&uid) {
            Some(existing) if Arc::ptr_eq(existing, peer) => {
                peers.remove(&uid);
                true
            }
            _ => false,
        }
    }

    /// Look up a peer by uid.
    pub fn get_peer(&self, uid: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(uid).cloned()
    }

    pub fn contains(&self, uid: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(uid)
    }

    /// Snapshot of all registered peers.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Registered peers except the one with uid `exclude`.
    pub fn peers_except(&self, exclude: Option<&str>) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .iter()
            .filter(|(uid, _)| Some(uid.as_str()) != exclude)
            .map(|(_, p)| Arc::clone(p))
            .collect()
    }

    pub fn uids(&self) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
