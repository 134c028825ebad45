//! Extension points consulted while peers connect.

use async_trait::async_trait;
use netron_wire::{Handshake, Peer};
use std::sync::Arc;

/// Verdict of a confirmation hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    /// Continue.
    Accept,
    /// Tell the other side it was refused, then close.
    Reject,
    /// Close without telling the other side anything.
    Disconnect,
}

/// Hooks a deployer can plug into the connection lifecycle.
///
/// Every method has a default, so implementations override only what they need.
#[async_trait]
pub trait NetronHooks: Send + Sync + 'static {
    /// A peer object was created, before its first status change.
    fn peer_created(&self, _peer: &Arc<Peer>) {}

    /// Decide on a freshly accepted transport before any handshake.
    ///
    /// Only consulted when `restrict_access` is enabled; the default refuses.
    async fn confirm_connection(&self, _peer: &Arc<Peer>) -> Confirm {
        Confirm::Reject
    }

    /// Decide on a peer after its handshake was received, on either side.
    async fn confirm_peer(&self, _peer: &Arc<Peer>, _handshake: &Handshake) -> Confirm {
        Confirm::Accept
    }

    /// Add custom data (such as credentials) to an outgoing handshake or ack.
    async fn handshake_payload(&self, _peer: &Arc<Peer>, _handshake: &mut Handshake) {}
}

/// Hooks with every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl NetronHooks for DefaultHooks {}
