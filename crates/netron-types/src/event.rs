//! Observable runtime and peer events.

use crate::definition::Definition;
use crate::status::PeerStatus;
use serde::{Deserialize, Serialize};

/// Process-local id of a peer connection object.
///
/// Unlike a uid, it exists before the handshake completes.
pub type PeerId = u64;

/// Event emitted by a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetronEvent {
    /// A peer object was created, before any connection attempt.
    PeerCreate {
        /// The peer's local id.
        peer_id: PeerId,
    },
    /// The transport was established and the handshake is starting.
    PeerConnect {
        /// The peer's local id.
        peer_id: PeerId,
    },
    /// The handshake completed.
    PeerOnline {
        /// The peer's local id.
        peer_id: PeerId,
        /// The remote runtime's uid.
        uid: String,
    },
    /// A peer went offline.
    PeerOffline {
        /// The peer's local id.
        peer_id: PeerId,
        /// The remote uid, if the handshake had completed.
        uid: Option<String>,
    },
    /// A dial attempt failed and will be retried.
    ReconnectAttempt {
        /// The address being dialed.
        addr: String,
        /// 1-based retry number.
        attempt: u32,
    },
    /// A context became available, locally or from a peer.
    ContextAttach {
        /// The definition as seen by this runtime.
        definition: Definition,
        /// Uid of the peer that advertised it; `None` for local contexts.
        origin: Option<String>,
    },
    /// A context went away.
    ContextDetach {
        /// Name of the detached context.
        name: String,
        /// Definition id as seen by this runtime.
        def_id: u64,
        /// Uid of the peer that advertised it; `None` for local contexts.
        origin: Option<String>,
    },
}

impl NetronEvent {
    /// Every value [`NetronEvent::kind`] can return.
    pub const KINDS: [&'static str; 7] = [
        "peer create",
        "peer connect",
        "peer online",
        "peer offline",
        "reconnect attempt",
        "context attach",
        "context detach",
    ];

    /// Uid of the peer a context event came from.
    pub fn origin(&self) -> Option<&str> {
        match self {
            NetronEvent::ContextAttach { origin, .. } | NetronEvent::ContextDetach { origin, .. } => {
                origin.as_deref()
            }
            _ => None,
        }
    }

    /// Event name, also used to subscribe to a remote runtime's events.
    pub fn kind(&self) -> &'static str {
        match self {
            NetronEvent::PeerCreate { .. } => "peer create",
            NetronEvent::PeerConnect { .. } => "peer connect",
            NetronEvent::PeerOnline { .. } => "peer online",
            NetronEvent::PeerOffline { .. } => "peer offline",
            NetronEvent::ReconnectAttempt { .. } => "reconnect attempt",
            NetronEvent::ContextAttach { .. } => "context attach",
            NetronEvent::ContextDetach { .. } => "context detach",
        }
    }
}

/// Event emitted by a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PeerEvent {
    /// The status changed.
    Status {
        /// The new status.
        status: PeerStatus,
    },
    /// A dial attempt for this peer failed and will be retried.
    ReconnectAttempt {
        /// 1-based retry number.
        attempt: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = NetronEvent::PeerOffline {
            peer_id: 3,
            uid: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "peer_offline");
        assert!(json["uid"].is_null());
        assert_eq!(event.kind(), "peer offline");
        assert!(NetronEvent::KINDS.contains(&event.kind()));
    }

    #[test]
    fn test_context_event_origin() {
        let event = NetronEvent::ContextDetach {
            name: "x".to_string(),
            def_id: 2,
            origin: Some("b".to_string()),
        };
        assert_eq!(event.origin(), Some("b"));
        assert_eq!(event.kind(), "context detach");
        assert!(NetronEvent::PeerCreate { peer_id: 1 }.origin().is_none());
    }

    #[test]
    fn test_peer_event_status() {
        let event = PeerEvent::Status {
            status: PeerStatus::Online,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"status","status":"online"}"#);
    }
}
