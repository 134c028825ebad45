//! Peer connection status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection status of a peer, in lifecycle order.
///
/// `Offline` is both the initial and the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PeerStatus {
    Offline = 0,
    Connecting = 1,
    Handshaking = 2,
    Online = 3,
}

impl PeerStatus {
    /// Numeric value carried by status events.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether requests may be sent in this state.
    pub fn can_send(self) -> bool {
        matches!(self, PeerStatus::Handshaking | PeerStatus::Online)
    }
}

impl TryFrom<u8> for PeerStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PeerStatus::Offline),
            1 => Ok(PeerStatus::Connecting),
            2 => Ok(PeerStatus::Handshaking),
            3 => Ok(PeerStatus::Online),
            other => Err(other),
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Offline => "offline",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Handshaking => "handshaking",
            PeerStatus::Online => "online",
        };
        f.write_str(s)
    }
}
