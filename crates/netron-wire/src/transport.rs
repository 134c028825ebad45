//! Transport abstraction: an ordered, reliable, bidirectional packet channel.

use crate::message::{decode_length, decode_packet, encode_packet, Packet, MAX_PACKET_SIZE};
use async_trait::async_trait;
use netron_types::error::NetronError;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: u32, max: u32 },
}

impl From<WireError> for NetronError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(e) => NetronError::Io(e),
            WireError::Json(e) => NetronError::Serialization(e.to_string()),
            WireError::ConnectionClosed => NetronError::PeerDisconnected,
            e @ WireError::PacketTooLarge { .. } => NetronError::Protocol(e.to_string()),
        }
    }
}

/// A connection that carries whole packets.
///
/// `recv` is only ever polled by one task at a time; `send` may be called
/// concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one packet.
    async fn send(&self, packet: &Packet) -> Result<(), WireError>;

    /// Receive the next packet, or `None` once the other side has closed.
    async fn recv(&self) -> Result<Option<Packet>, WireError>;

    /// Close the sending direction. The other side sees end-of-stream.
    async fn close(&self);

    /// Human-readable remote address, if any.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// Length-prefixed JSON over TCP.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    remote: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let remote = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote,
        }
    }

    /// Dial `addr`.
    pub async fn connect(addr: &str) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, packet: &Packet) -> Result<(), WireError> {
        let bytes = encode_packet(packet)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(closed_on_reset)?;
        writer.flush().await.map_err(closed_on_reset)?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Packet>, WireError> {
        let mut reader = self.reader.lock().await;
        let mut header = [0u8; 4];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if is_eof(&e) => return Ok(None),
            Err(e) => return Err(WireError::Io(e)),
        }

        let len = decode_length(&header);
        if len > MAX_PACKET_SIZE {
            return Err(WireError::PacketTooLarge {
                size: len,
                max: MAX_PACKET_SIZE,
            });
        }

        let mut body = vec![0u8; len as usize];
        match reader.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if is_eof(&e) => return Ok(None),
            Err(e) => return Err(WireError::Io(e)),
        }
        Ok(Some(decode_packet(&body)?))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote.map(|a| a.to_string())
    }
}

fn is_eof(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

fn closed_on_reset(e: std::io::Error) -> WireError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected => WireError::ConnectionClosed,
        _ => WireError::Io(e),
    }
}
