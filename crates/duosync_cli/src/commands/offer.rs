//! Offer command implementation.

use duosync_crypto::{generate_device_id, generate_pairing_pin, generate_secret};
use duosync_engine::{ConfigStore, FileConfigStore, PairingPayload};
use std::path::Path;

/// Builds a pairing payload for `address`.
///
/// The device id comes from the config in `config_dir`, which is created on
/// first use. Without a directory a throwaway id is generated.
pub fn build(
    address: &str,
    config_dir: Option<&Path>,
) -> Result<(PairingPayload, String), Box<dyn std::error::Error>> {
    if address.trim().is_empty() {
        return Err("address must not be empty".into());
    }

    let device_id = match config_dir {
        Some(dir) => {
            let store = FileConfigStore::new(dir);
            let config = store.load()?;
            tracing::debug!(path = %store.path().display(), "loaded sync config");
            config.device_id
        }
        None => generate_device_id(),
    };

    let key = generate_secret();
    tracing::info!(device_id = %device_id, key = %key.fingerprint(), "pairing offer created");
    Ok((
        PairingPayload::new(address, &key, device_id),
        generate_pairing_pin(),
    ))
}

/// Runs the offer command.
pub fn run(address: &str, config_dir: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let (payload, pin) = build(address, config_dir)?;
    println!("{}", payload.to_json()?);
    println!("PIN: {pin}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn offer_reuses_stored_device_id() {
        let dir = tempdir().unwrap();
        let (first, pin) = build("relay://a", Some(dir.path())).unwrap();
        let (second, _) = build("relay://a", Some(dir.path())).unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_ne!(first.secret, second.secret);
        assert_eq!(pin.len(), 6);
        assert!(PairingPayload::parse(&first.to_json().unwrap()).is_ok());
    }

    #[test]
    fn offer_rejects_empty_address() {
        assert!(build("  ", None).is_err());
    }
}
