//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetronConfig {
    /// Explicit runtime identity. A random UUID is generated when absent.
    pub uid: Option<String>,
    /// Hub mode: relay context notifications between peers.
    pub is_super: bool,
    /// Dial retry budget (0 disables reconnecting).
    pub reconnects: u32,
    /// Per-request response timeout in milliseconds (none = unbounded).
    pub response_timeout_ms: Option<u64>,
    /// Consult the connection-confirm hook for every accepted transport.
    pub restrict_access: bool,
    /// Upper bound on handshake completion in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Default listen address for `bind`.
    pub listen_addr: Option<SocketAddr>,
    /// Pre-shared secret for the built-in handshake authentication.
    pub shared_secret: Option<String>,
    /// Reconnect backoff.
    pub connect: ConnectConfig,
}

impl Default for NetronConfig {
    fn default() -> Self {
        Self {
            uid: None,
            is_super: false,
            reconnects: 0,
            response_timeout_ms: None,
            restrict_access: false,
            handshake_timeout_ms: 15_000,
            listen_addr: None,
            shared_secret: None,
            connect: ConnectConfig::default(),
        }
    }
}

impl NetronConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// The configured uid, or a freshly generated one.
    pub fn resolve_uid(&self) -> String {
        match &self.uid {
            Some(uid) if !uid.is_empty() => uid.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Response timeout as a duration.
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Backoff between dial attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Delay before the first retry in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 300,
            max_delay_ms: 3_000,
            jitter: 0.2,
        }
    }
}
