//! In-memory transport pair.
//!
//! Packets still go through the JSON codec so both ends observe exactly what
//! a TCP peer would.

use crate::message::{decode_packet, encode_packet, Packet};
use crate::transport::{Transport, WireError};
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};

/// One end of an in-memory connection.
pub struct DuplexTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    label: String,
}

impl DuplexTransport {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: StdMutex::new(Some(a_tx)),
                rx: Mutex::new(a_rx),
                label: "duplex:b".to_string(),
            },
            Self {
                tx: StdMutex::new(Some(b_tx)),
                rx: Mutex::new(b_rx),
                label: "duplex:a".to_string(),
            },
        )
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, packet: &Packet) -> Result<(), WireError> {
        let bytes = encode_packet(packet)?;
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| WireError::ConnectionClosed),
            None => Err(WireError::ConnectionClosed),
        }
    }

    async fn recv(&self) -> Result<Option<Packet>, WireError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(bytes) => Ok(Some(decode_packet(&bytes[4..])?)),
            None => Ok(None),
        }
    }

    async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.label.clone())
    }
}
