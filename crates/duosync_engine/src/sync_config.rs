//! Persisted pairing state.

use crate::error::SyncResult;
use duosync_crypto::{generate_device_id, EncryptionKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application key the sync configuration is stored under.
pub const CONFIG_KEY: &str = "duosync.sync-config";

/// Per-device sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Whether sync is switched on.
    #[serde(default)]
    pub enabled: bool,
    /// This device's id.
    pub device_id: String,
    /// The paired device's id.
    #[serde(default)]
    pub peer_device_id: Option<String>,
    /// The shared channel key, base64 on disk.
    #[serde(default, with = "secret_base64")]
    pub shared_secret: Option<EncryptionKey>,
    /// Completion time of the last full sync.
    #[serde(default)]
    pub last_sync_at: Option<i64>,
}

impl SyncConfig {
    /// Creates an unpaired configuration for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            enabled: false,
            device_id: device_id.into(),
            peer_device_id: None,
            shared_secret: None,
            last_sync_at: None,
        }
    }

    /// Creates an unpaired configuration with a freshly generated device id.
    pub fn fresh() -> Self {
        Self::new(generate_device_id())
    }

    /// Returns true if pairing completed.
    pub fn is_paired(&self) -> bool {
        self.peer_device_id.is_some() && self.shared_secret.is_some()
    }

    /// Records a completed pairing and switches sync on.
    pub fn pair(&mut self, peer_device_id: impl Into<String>, secret: EncryptionKey) {
        self.peer_device_id = Some(peer_device_id.into());
        self.shared_secret = Some(secret);
        self.enabled = true;
    }

    /// Forgets the peer. Application data is not touched.
    pub fn unpair(&mut self) {
        self.peer_device_id = None;
        self.shared_secret = None;
        self.enabled = false;
    }
}

mod secret_base64 {
    use duosync_crypto::EncryptionKey;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        key: &Option<EncryptionKey>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => serializer.serialize_some(&key.to_base64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<EncryptionKey>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| EncryptionKey::from_base64(&encoded).map_err(D::Error::custom))
            .transpose()
    }
}

/// Storage for the [`SyncConfig`].
pub trait ConfigStore: Send + Sync {
    /// Loads the configuration, creating a fresh one on first run.
    fn load(&self) -> SyncResult<SyncConfig>;

    /// Persists the configuration.
    fn save(&self, config: &SyncConfig) -> SyncResult<()>;

    /// Loads, modifies and saves the configuration.
    fn update(&self, f: &mut dyn FnMut(&mut SyncConfig)) -> SyncResult<SyncConfig> {
        let mut config = self.load()?;
        f(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

/// Configuration held in memory.
#[derive(Debug)]
pub struct MemoryConfigStore {
    config: Mutex<SyncConfig>,
}

impl MemoryConfigStore {
    /// Creates a store holding `config`.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new(SyncConfig::fresh())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> SyncResult<SyncConfig> {
        Ok(self.config.lock().clone())
    }

    fn save(&self, config: &SyncConfig) -> SyncResult<()> {
        *self.config.lock() = config.clone();
        Ok(())
    }
}

/// Configuration stored as a JSON file inside a directory.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    /// Creates a store for `dir`. The directory is created on first save.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{CONFIG_KEY}.json")),
        }
    }

    /// Path of the configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> SyncResult<SyncConfig> {
        if !self.path.exists() {
            let config = SyncConfig::fresh();
            tracing::info!(device_id = %config.device_id, path = %self.path.display(), "created sync config");
            self.save(&config)?;
            return Ok(config);
        }
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, config: &SyncConfig) -> SyncResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(config)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
