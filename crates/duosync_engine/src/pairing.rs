//! Pairing two devices that have never talked.
//!
//! The initiator shows a [`PairingPayload`] (QR code or copy-paste) and
//! listens at its own address. The responder dials that address with the
//! payload's secret and introduces itself with `hello`. The first `hello`
//! that decrypts under the offered secret completes pairing on the
//! initiator, which echoes its own `hello` back to complete the responder.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::connection::{peer_address, ConnectionEvent, ConnectionManager, ConnectionStatus};
use crate::error::{ConnectionError, PairingError, PairingResult};
use crate::sync_config::ConfigStore;
use crate::transport::Transport;
use duosync_crypto::{generate_pairing_pin, generate_secret, EncryptionKey};
use duosync_protocol::{Hello, SyncMessage, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Data transferred out of band to start pairing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    /// Transport address of the initiator.
    pub peer_address: String,
    /// Base64 channel key.
    pub secret: String,
    /// Device id of the initiator.
    pub device_id: String,
}

impl std::fmt::Debug for PairingPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingPayload")
            .field("peer_address", &self.peer_address)
            .field("secret", &"<redacted>")
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl PairingPayload {
    /// Creates a payload.
    pub fn new(
        peer_address: impl Into<String>,
        key: &EncryptionKey,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            peer_address: peer_address.into(),
            secret: key.to_base64(),
            device_id: device_id.into(),
        }
    }

    /// Encodes the payload as JSON for display.
    pub fn to_json(&self) -> PairingResult<String> {
        serde_json::to_string(self).map_err(|e| PairingError::invalid_payload(e.to_string()))
    }

    /// Parses and validates a scanned or pasted payload.
    ///
    /// Every field must be a non-empty string and the secret must decode to
    /// a valid key.
    pub fn parse(raw: &str) -> PairingResult<Self> {
        let payload: PairingPayload =
            serde_json::from_str(raw.trim()).map_err(|e| PairingError::invalid_payload(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Checks that the payload is usable.
    pub fn validate(&self) -> PairingResult<()> {
        for (field, value) in [
            ("peerAddress", &self.peer_address),
            ("secret", &self.secret),
            ("deviceId", &self.device_id),
        ] {
            if value.trim().is_empty() {
                return Err(PairingError::invalid_payload(format!("{field} is empty")));
            }
        }
        self.key().map(|_| ())
    }

    /// Decodes the channel key.
    pub fn key(&self) -> PairingResult<EncryptionKey> {
        EncryptionKey::from_base64(&self.secret)
            .map_err(|e| PairingError::invalid_payload(format!("secret: {e}")))
    }
}

/// An offer shown by the initiator.
#[derive(Debug, Clone)]
pub struct PairingOffer {
    /// The payload to transfer.
    pub payload: PairingPayload,
    /// PIN shown on both screens for the user to compare.
    pub pin: String,
    /// The offered channel key.
    pub key: EncryptionKey,
}

/// Runs the pairing protocol for one device.
pub struct Pairing<T: Transport> {
    transport: Arc<T>,
    config_store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<T: Transport> Pairing<T> {
    /// Creates a pairing runner.
    pub fn new(transport: Arc<T>, config_store: Arc<dyn ConfigStore>) -> Self {
        Self {
            transport,
            config_store,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Creates an offer with a fresh secret.
    pub fn offer(&self) -> PairingResult<PairingOffer> {
        let device = self.config_store.load()?;
        let key = generate_secret();
        let payload = PairingPayload::new(peer_address(&device.device_id), &key, &device.device_id);
        tracing::info!(device_id = %device.device_id, key = %key.fingerprint(), "pairing offer created");
        Ok(PairingOffer {
            payload,
            pin: generate_pairing_pin(),
            key,
        })
    }

    /// Waits for a responder to connect with the offered secret.
    ///
    /// Frames encrypted under any other key are ignored. Returns the peer's
    /// device id once pairing is persisted, or [`PairingError::Timeout`] if
    /// no responder completes within the pairing timeout.
    pub async fn await_responder(&self, offer: &PairingOffer) -> PairingResult<String> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            Arc::clone(&self.transport),
            offer.payload.peer_address.clone(),
            self.config.reconnect.clone(),
            Arc::new(events_tx),
        );

        if let Err(err) = manager.listen(&offer.key).await {
            manager.destroy().await;
            return Err(err.into());
        }

        let waiting = async {
            loop {
                match events.recv().await {
                    Some(ConnectionEvent::Message(raw)) => {
                        let Some(hello) = parse_hello(&raw) else {
                            continue;
                        };
                        if let Err(err) = self.complete(&hello.device_id, &offer.key) {
                            return Err(err);
                        }
                        let echo =
                            SyncMessage::hello(self.clock.now_millis(), &offer.payload.device_id);
                        if !manager.send(&echo) {
                            tracing::warn!("pairing echo could not be sent");
                        }
                        return Ok(hello.device_id);
                    }
                    Some(ConnectionEvent::Error(ConnectionError::DecryptionFailed)) => {
                        tracing::debug!("ignoring connection with a different secret");
                    }
                    Some(ConnectionEvent::Error(ConnectionError::DeviceIdCollision)) => {
                        return Err(ConnectionError::DeviceIdCollision.into());
                    }
                    Some(_) => {}
                    None => return Err(ConnectionError::Destroyed.into()),
                }
            }
        };

        let result = match tokio::time::timeout(self.config.pairing_timeout, waiting).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(address = %offer.payload.peer_address, "no responder before pairing timeout");
                Err(PairingError::Timeout)
            }
        };

        manager.destroy().await;
        result
    }

    /// Connects to the initiator described by `raw` and completes pairing.
    ///
    /// Returns the peer's device id once pairing is persisted.
    pub async fn respond(&self, raw: &str) -> PairingResult<String> {
        let payload = PairingPayload::parse(raw)?;
        let key = payload.key()?;
        let device = self.config_store.load()?;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            Arc::clone(&self.transport),
            peer_address(&device.device_id),
            self.config.reconnect.clone(),
            Arc::new(events_tx),
        );

        match manager.connect(&payload.peer_address, &key).await {
            Ok(()) | Err(ConnectionError::PeerUnreachable(_)) => {}
            Err(err) => {
                manager.destroy().await;
                return Err(err.into());
            }
        }

        let exchange = async {
            loop {
                match events.recv().await {
                    Some(ConnectionEvent::StatusChanged(ConnectionStatus::Connected)) => {
                        let hello = SyncMessage::hello(self.clock.now_millis(), &device.device_id);
                        manager.send(&hello);
                    }
                    Some(ConnectionEvent::Message(raw)) => {
                        let Some(hello) = parse_hello(&raw) else {
                            continue;
                        };
                        if hello.device_id != payload.device_id {
                            return Err(PairingError::invalid_payload(format!(
                                "peer identified as {}, expected {}",
                                hello.device_id, payload.device_id
                            )));
                        }
                        return Ok(hello.device_id);
                    }
                    Some(ConnectionEvent::Error(ConnectionError::DeviceIdCollision)) => {
                        return Err(ConnectionError::DeviceIdCollision.into());
                    }
                    Some(_) => {}
                    None => return Err(ConnectionError::Destroyed.into()),
                }
            }
        };

        let result = match tokio::time::timeout(self.config.pairing_timeout, exchange).await {
            Ok(Ok(peer_id)) => self.complete(&peer_id, &key).map(|()| peer_id),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                tracing::warn!(peer = %payload.peer_address, "pairing timed out");
                Err(PairingError::Timeout)
            }
        };

        manager.destroy().await;
        result
    }

    /// Forgets the peer on this device only.
    pub fn unpair(&self) -> PairingResult<()> {
        self.config_store.update(&mut |config| config.unpair())?;
        tracing::info!("unpaired");
        Ok(())
    }

    fn complete(&self, peer_device_id: &str, key: &EncryptionKey) -> PairingResult<()> {
        self.config_store
            .update(&mut |config| config.pair(peer_device_id, key.clone()))?;
        tracing::info!(peer = %peer_device_id, key = %key.fingerprint(), "pairing complete");
        Ok(())
    }
}

fn parse_hello(raw: &str) -> Option<Hello> {
    match SyncMessage::from_json(raw) {
        Ok(SyncMessage::Hello(hello)) => {
            if hello.protocol_version != PROTOCOL_VERSION {
                tracing::warn!(
                    peer = %hello.device_id,
                    version = hello.protocol_version,
                    "peer speaks a different protocol version"
                );
            }
            Some(hello)
        }
        Ok(other) => {
            tracing::debug!(kind = other.kind(), "ignoring message during pairing");
            None
        }
        Err(err) => {
            tracing::debug!(error = %err, "ignoring undecodable message during pairing");
            None
        }
    }
}
