//! Inspect command implementation.

use duosync_engine::PairingPayload;
use serde::Serialize;

/// Summary of a valid pairing payload. The secret is never printed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResult {
    /// Address the responder will dial.
    pub peer_address: String,
    /// Initiator device id.
    pub device_id: String,
    /// Fingerprint of the channel key.
    pub key_fingerprint: String,
}

/// Validates `raw` and summarizes it.
pub fn inspect(raw: &str) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let payload = PairingPayload::parse(raw)?;
    let key = payload.key()?;
    Ok(InspectResult {
        peer_address: payload.peer_address,
        device_id: payload.device_id,
        key_fingerprint: key.fingerprint(),
    })
}

/// Runs the inspect command.
pub fn run(raw: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(raw)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Pairing payload is valid");
            println!("  Peer address: {}", result.peer_address);
            println!("  Device id:    {}", result.device_id);
            println!("  Key:          {}", result.key_fingerprint);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use duosync_crypto::EncryptionKey;

    #[test]
    fn inspect_valid_payload() {
        let key = EncryptionKey::generate();
        let raw = PairingPayload::new("relay://a", &key, "dev-a")
            .to_json()
            .unwrap();

        let result = inspect(&raw).unwrap();
        assert_eq!(result.device_id, "dev-a");
        assert_eq!(result.key_fingerprint, key.fingerprint());
    }

    #[test]
    fn inspect_rejects_invalid_payload() {
        let err = inspect(r#"{"peerAddress":"relay://a","deviceId":"dev-a"}"#).unwrap_err();
        assert!(err.to_string().contains("invalid pairing payload"));
    }
}
