//! Error types for graphmon-client.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Main error type for all monitor operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// WebSocket error during connect/send/receive.
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    /// JSON decode/encode error for protocol messages.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed wire frame (bad tag payload, invalid UTF-8).
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// The connection attempt did not complete within the configured
    /// timeout.
    #[error("Connection attempt timed out")]
    ConnectTimeout,

    /// The session task is gone; the handle can no longer be used.
    #[error("Session closed")]
    SessionClosed,
}

/// Result type alias using MonitorError.
pub type Result<T> = std::result::Result<T, MonitorError>;
