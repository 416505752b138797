//! Key, device id and PIN generation.

use duosync_crypto::{generate_device_id, generate_pairing_pin, generate_secret};

/// Prints a fresh base64 channel key.
pub fn keygen() {
    let key = generate_secret();
    println!("{}", key.to_base64());
    tracing::debug!(fingerprint = %key.fingerprint(), "generated key");
}

/// Prints a fresh device id.
pub fn device_id() {
    println!("{}", generate_device_id());
}

/// Prints a pairing PIN.
pub fn pin() {
    println!("{}", generate_pairing_pin());
}
