//! Identifier, PIN and secret generation.

use crate::key::EncryptionKey;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{Rng, RngCore};

/// Random bytes behind a device id (encodes to 16 URL-safe characters).
pub const DEVICE_ID_BYTES: usize = 12;

/// Generates a fresh 32-byte shared secret.
#[must_use]
pub fn generate_secret() -> EncryptionKey {
    EncryptionKey::generate()
}

/// Generates a short URL-safe device identifier.
#[must_use]
pub fn generate_device_id() -> String {
    let mut bytes = [0u8; DEVICE_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generates a 6-digit PIN shown to the user while pairing.
///
/// The PIN is cosmetic; it is not key material.
#[must_use]
pub fn generate_pairing_pin() -> String {
    let pin: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{pin:06}")
}
