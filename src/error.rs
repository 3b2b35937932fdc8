//! Error types for makerbot-rpc.

use thiserror::Error;

use crate::jsonrpc::RemoteError;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during TCP resolve/connect/read/write.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error while talking to the printer's auth endpoint or Reflector.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error object returned by the printer in an RPC response.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Operation attempted on a client that never connected.
    #[error("client is not connected (hint: call connect() first)")]
    NotConnected,

    /// The connection was lost while an operation was in flight.
    #[error("connection to printer lost")]
    Disconnected,

    /// A subscriber is already installed for this notification method.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    /// Reflector handed back a relay address that is not `host:port`.
    #[error("malformed relay address: {0}")]
    InvalidRelay(String),

    /// The printer (or Thingiverse) refused to authenticate us.
    #[error("authentication refused: {0}")]
    AuthRefused(String),

    /// Protocol violation (unexpected reply shape, short camera header, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
