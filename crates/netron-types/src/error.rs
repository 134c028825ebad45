//! Shared error types for the Netron runtime.

use thiserror::Error;

/// Wire code for a remote application error.
pub const CODE_REMOTE: i32 = 500;

/// Top-level error type for the Netron runtime.
#[derive(Error, Debug)]
pub enum NetronError {
    /// Dial or handshake failure, possibly after exhausting reconnects.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer went offline while a request was in flight.
    #[error("Peer disconnected")]
    PeerDisconnected,

    /// No response arrived within the configured response timeout.
    #[error("Response timeout {0}ms exceeded")]
    Timeout(u64),

    /// A context, definition or peer lookup missed.
    #[error("Unknown: {0}")]
    Unknown(String),

    /// The value cannot be attached as a context.
    #[error("Not valid: {0}")]
    NotValid(String),

    /// The operation is not allowed for this context.
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// A context or twin with this name already exists.
    #[error("Already exists: {0}")]
    Exists(String),

    /// Malformed API call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer status forbids the operation.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A malformed or unexpected packet was received.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An exception raised by application code on the other side.
    #[error("{0}")]
    Remote(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetronError {
    /// Numeric code carried by an `error` response packet.
    pub fn code(&self) -> i32 {
        match self {
            NetronError::InvalidArgument(_) => 400,
            NetronError::NotAllowed(_) => 403,
            NetronError::Unknown(_) => 404,
            NetronError::Exists(_) => 409,
            NetronError::IllegalState(_) => 412,
            NetronError::NotValid(_) => 422,
            NetronError::Remote(_) => CODE_REMOTE,
            NetronError::ConnectionFailed(_) => 502,
            NetronError::PeerDisconnected => 503,
            NetronError::Timeout(_) => 504,
            NetronError::Protocol(_) => 505,
            NetronError::Serialization(_) => 520,
            NetronError::Io(_) => 521,
        }
    }

    /// The message without the variant prefix, as sent over the wire.
    pub fn wire_message(&self) -> String {
        match self {
            NetronError::ConnectionFailed(m)
            | NetronError::Unknown(m)
            | NetronError::NotValid(m)
            | NetronError::NotAllowed(m)
            | NetronError::Exists(m)
            | NetronError::InvalidArgument(m)
            | NetronError::IllegalState(m)
            | NetronError::Protocol(m)
            | NetronError::Remote(m)
            | NetronError::Serialization(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from the code and message of an `error` packet.
    ///
    /// Unrecognized codes are treated as remote application errors.
    pub fn from_wire(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            400 => NetronError::InvalidArgument(message),
            403 => NetronError::NotAllowed(message),
            404 => NetronError::Unknown(message),
            409 => NetronError::Exists(message),
            412 => NetronError::IllegalState(message),
            422 => NetronError::NotValid(message),
            502 => NetronError::ConnectionFailed(message),
            503 => NetronError::PeerDisconnected,
            504 => NetronError::Timeout(
                message
                    .split_whitespace()
                    .find_map(|w| w.strip_suffix("ms").and_then(|n| n.parse().ok()))
                    .unwrap_or_default(),
            ),
            505 => NetronError::Protocol(message),
            520 => NetronError::Serialization(message),
            _ => NetronError::Remote(message),
        }
    }

    /// True for the outcomes that mean "the request never settled remotely".
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            NetronError::PeerDisconnected | NetronError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for NetronError {
    fn from(e: serde_json::Error) -> Self {
        NetronError::Serialization(e.to_string())
    }
}

/// Alias for Result with NetronError.
pub type NetronResult<T> = Result<T, NetronError>;
