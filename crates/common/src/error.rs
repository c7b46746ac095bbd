use thiserror::Error;

/// Error types for the webhook tunnel system
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("endpoint already has a subscriber")]
    AlreadyRegistered,

    #[error("no subscriber registered for endpoint")]
    NotRegistered,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid or missing agent token")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;
