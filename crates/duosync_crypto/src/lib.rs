//! # DuoSync Crypto
//!
//! Authenticated encryption and identifier generation for DuoSync.
//!
//! This crate provides:
//! - `EncryptionKey`: a 32-byte shared secret, zeroized on drop
//! - `CryptoBox`: AES-256-GCM encryption producing `base64(nonce || ciphertext)`
//! - Device id, pairing PIN and secret generation
//!
//! ## Security Model
//!
//! - A fresh random 96-bit nonce is drawn for every encryption
//! - Every decryption failure surfaces as the same opaque error
//! - Keys never appear in `Debug` output; log the fingerprint instead

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod cipher;
mod error;
mod ids;
mod key;

pub use cipher::{decrypt, encrypt, CryptoBox, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use ids::{generate_device_id, generate_pairing_pin, generate_secret, DEVICE_ID_BYTES};
pub use key::{EncryptionKey, KEY_SIZE};
