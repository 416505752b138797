//! Composition root for a paired device.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::connection::{peer_address, ConnectionManager, ConnectionStatus, Role};
use crate::driver::{spawn_engine, EngineHandle};
use crate::engine::{ConflictResolver, SyncEngine, SyncState, SyncStats};
use crate::error::{ConnectionError, SyncError, SyncResult};
use crate::store::LocalStore;
use crate::sync_config::ConfigStore;
use crate::transport::Transport;
use duosync_protocol::SyncChange;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Builder for [`SyncSession`].
pub struct SyncSessionBuilder<T: Transport, S: LocalStore> {
    transport: Arc<T>,
    store: Arc<S>,
    config_store: Arc<dyn ConfigStore>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<T: Transport, S: LocalStore + 'static> SyncSessionBuilder<T, S> {
    /// Sets the conflict resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
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

    /// Wires the connection and engine and opens the channel.
    ///
    /// The device whose id sorts lower dials; the other listens. An
    /// unreachable peer is not an error since the dialer keeps retrying.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotPaired`] if the stored configuration is not
    /// paired and enabled, and a connection error if this device's address
    /// is claimed by another session.
    pub async fn start(self) -> SyncResult<SyncSession<T>> {
        let device = self.config_store.load()?;
        let (Some(peer_device_id), Some(key)) =
            (device.peer_device_id.clone(), device.shared_secret.clone())
        else {
            return Err(SyncError::NotPaired);
        };
        if !device.enabled {
            return Err(SyncError::NotPaired);
        }

        let role = Role::for_pair(&device.device_id, &peer_device_id);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionManager::new(
            self.transport,
            peer_address(&device.device_id),
            self.config.reconnect.clone(),
            Arc::new(events_tx),
        ));

        let mut engine = SyncEngine::new(self.store, Arc::clone(&connection), self.config_store)?
            .with_clock(self.clock)
            .with_config(self.config);
        if let Some(resolver) = self.resolver {
            engine = engine.with_resolver(resolver);
        }
        let engine = spawn_engine(engine, events_rx);

        let opened = match role {
            Role::Dialer => connection.connect(&peer_address(&peer_device_id), &key).await,
            Role::Listener => connection.listen(&key).await,
        };
        match opened {
            Ok(()) | Err(ConnectionError::PeerUnreachable(_)) => {}
            Err(err) => {
                engine.shutdown().await;
                connection.destroy().await;
                return Err(err.into());
            }
        }

        tracing::info!(
            device_id = %device.device_id,
            peer = %peer_device_id,
            ?role,
            "sync session started"
        );
        Ok(SyncSession {
            connection,
            engine,
            device_id: device.device_id,
            peer_device_id,
        })
    }
}

/// A running sync session with the paired peer.
pub struct SyncSession<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    engine: EngineHandle,
    device_id: String,
    peer_device_id: String,
}

impl<T: Transport> SyncSession<T> {
    /// Starts building a session.
    pub fn builder<S: LocalStore + 'static>(
        transport: Arc<T>,
        store: Arc<S>,
        config_store: Arc<dyn ConfigStore>,
    ) -> SyncSessionBuilder<T, S> {
        SyncSessionBuilder {
            transport,
            store,
            config_store,
            resolver: None,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    /// This device's id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The peer's device id.
    pub fn peer_device_id(&self) -> &str {
        &self.peer_device_id
    }

    /// Sends a local change, or queues it while offline.
    pub fn record_change(&self, change: SyncChange) -> SyncResult<()> {
        self.engine.record_change(change)
    }

    /// Starts a full sync.
    pub fn resync(&self) -> SyncResult<()> {
        self.engine.resync()
    }

    /// Connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Engine state.
    pub fn sync_state(&self) -> SyncState {
        self.engine.state()
    }

    /// Engine statistics.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    /// Closes the channel. Changes are queued until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Re-opens the channel after [`disconnect`](Self::disconnect).
    pub async fn reconnect(&self) -> SyncResult<()> {
        match self.connection.reconnect().await {
            Ok(()) | Err(ConnectionError::PeerUnreachable(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stops the engine and releases the connection.
    pub async fn shutdown(self) {
        self.engine.shutdown().await;
        self.connection.destroy().await;
        tracing::info!(device_id = %self.device_id, "sync session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::store::MemoryStore;
    use crate::sync_config::{MemoryConfigStore, SyncConfig};
    use duosync_crypto::EncryptionKey;

    #[tokio::test]
    async fn start_requires_pairing() {
        let network = LoopbackNetwork::new();
        let result = SyncSession::builder(
            Arc::new(network.transport()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryConfigStore::new(SyncConfig::new("dev-a"))),
        )
        .start()
        .await;
        assert!(matches!(result, Err(SyncError::NotPaired)));
    }

    #[tokio::test]
    async fn start_requires_enabled() {
        let network = LoopbackNetwork::new();
        let mut config = SyncConfig::new("dev-a");
        config.pair("dev-b", EncryptionKey::generate());
        config.enabled = false;

        let result = SyncSession::builder(
            Arc::new(network.transport()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryConfigStore::new(config)),
        )
        .start()
        .await;
        assert!(matches!(result, Err(SyncError::NotPaired)));
    }

    #[tokio::test(start_paused = true)]
    async fn dialer_starts_with_unreachable_peer() {
        let network = LoopbackNetwork::new();
        let mut config = SyncConfig::new("dev-a");
        config.pair("dev-b", EncryptionKey::generate());

        let session = SyncSession::builder(
            Arc::new(network.transport()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryConfigStore::new(config)),
        )
        .start()
        .await
        .unwrap();

        assert_eq!(session.connection().role(), Some(Role::Dialer));
        assert_eq!(session.status(), ConnectionStatus::Error);
        assert!(session.connection().reconnect_pending());
        session.shutdown().await;
        assert!(!network.is_registered(&peer_address("dev-a")));
    }
}
