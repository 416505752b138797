//! Error types for pairing, connection and sync.

use duosync_crypto::CryptoError;
use duosync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Result type for pairing operations.
pub type PairingResult<T> = Result<T, PairingError>;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the connection manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer could not be reached. Reconnection is scheduled.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Another live session already claimed this device's address.
    #[error("device id already in use by another session")]
    DeviceIdCollision,

    /// An inbound frame failed to decrypt and was discarded.
    #[error("decryption failed")]
    DecryptionFailed,

    /// No channel is open.
    #[error("not connected to peer")]
    NotConnected,

    /// The manager was destroyed.
    #[error("connection manager destroyed")]
    Destroyed,
}

impl ConnectionError {
    /// Returns true if this error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::PeerUnreachable(_) | ConnectionError::NotConnected
        )
    }
}

/// Errors raised while pairing two devices.
#[derive(Error, Debug)]
pub enum PairingError {
    /// The scanned or pasted payload is unusable. Not retried.
    #[error("invalid pairing payload: {0}")]
    InvalidPairingPayload(String),

    /// The pairing connection failed.
    #[error("pairing connection failed: {0}")]
    Connection(#[from] ConnectionError),

    /// The peer did not answer in time.
    #[error("pairing timed out")]
    Timeout,

    /// The pairing result could not be persisted.
    #[error("pairing store error: {0}")]
    Store(#[from] SyncError),

    /// Key handling failed.
    #[error("pairing crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl PairingError {
    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPairingPayload(message.into())
    }
}

/// Errors raised by the sync engine and its stores.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The peer sent data that does not match the payload schema.
    #[error("malformed remote payload: {0}")]
    MalformedRemotePayload(String),

    /// A message could not be written to the channel. The change is re-queued.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The local store failed.
    #[error("store error: {0}")]
    Store(String),

    /// This device is not paired.
    #[error("device is not paired")]
    NotPaired,

    /// The engine task is no longer running.
    #[error("sync engine stopped")]
    EngineStopped,

    /// Connection failure.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::SendFailed(_) => true,
            SyncError::Connection(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ConnectionError::PeerUnreachable("dev-b".into()).is_retryable());
        assert!(!ConnectionError::DeviceIdCollision.is_retryable());
        assert!(!ConnectionError::Destroyed.is_retryable());

        assert!(SyncError::SendFailed("channel closed".into()).is_retryable());
        assert!(SyncError::from(ConnectionError::NotConnected).is_retryable());
        assert!(!SyncError::NotPaired.is_retryable());
        assert!(!SyncError::MalformedRemotePayload("todos".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(
            ConnectionError::DeviceIdCollision.to_string(),
            "device id already in use by another session"
        );
        assert_eq!(ConnectionError::DecryptionFailed.to_string(), "decryption failed");

        let err = PairingError::invalid_payload("missing secret");
        assert!(err.to_string().contains("missing secret"));
    }
}
