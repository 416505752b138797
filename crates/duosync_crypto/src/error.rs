//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during crypto operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// Key material is not valid base64.
    #[error("invalid key encoding")]
    InvalidEncoding,

    /// Encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption failed.
    ///
    /// Deliberately carries no detail: a wrong key, a tampered frame, a truncated
    /// frame and garbage input are indistinguishable to the caller.
    #[error("decryption failed")]
    DecryptionFailed,
}

impl CryptoError {
    /// Creates an invalid key length error.
    pub fn invalid_key_length(actual: usize, expected: usize) -> Self {
        Self::InvalidKeyLength { expected, actual }
    }
}
