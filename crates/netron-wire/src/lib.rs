//! Netron wire protocol: peer-to-peer remote-object networking.
//!
//! Provides the packet envelope exchanged between runtimes, the transport
//! abstraction packets travel over, and the per-connection [`Peer`] state
//! machine that correlates requests with responses.
//!
//! ## Architecture
//!
//! - **Packet**: JSON-framed protocol messages (request / response / notification)
//! - **Transport**: ordered bidirectional packet channel (TCP or in-memory duplex)
//! - **Peer**: one connection, its status, awaiter table and advertised definitions
//! - **PeerRegistry**: online peers keyed by remote uid
//! - **PeerHandle**: trait through which a peer hands inbound traffic to the runtime

pub mod duplex;
pub mod message;
pub mod peer;
pub mod registry;
pub mod transport;

pub use duplex::DuplexTransport;
pub use message::{Handshake, Notification, Packet, PacketKind, Request, Response};
pub use peer::{Peer, PeerHandle};
pub use registry::PeerRegistry;
pub use transport::{TcpTransport, Transport, WireError};
