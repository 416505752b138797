//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or validating protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A payload does not match the expected schema.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// An incremental change is malformed.
    #[error("invalid change: {0}")]
    InvalidChange(String),
}

impl ProtocolError {
    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    /// Creates an invalid change error.
    pub fn invalid_change(message: impl Into<String>) -> Self {
        Self::InvalidChange(message.into())
    }
}
