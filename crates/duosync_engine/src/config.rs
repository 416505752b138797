//! Runtime configuration for pairing, connection and sync.

use duosync_protocol::DEFAULT_CONFLICT_WINDOW_MS;
use rand::Rng;
use std::time::Duration;

/// Runtime tuning for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Edits closer together than this are conflicts.
    pub conflict_window: Duration,
    /// Reconnection backoff.
    pub reconnect: ReconnectPolicy,
    /// How long a responder waits for pairing to complete.
    pub pairing_timeout: Duration,
    /// How long deletion markers are kept.
    pub tombstone_retention: Duration,
}

impl EngineConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            conflict_window: Duration::from_millis(DEFAULT_CONFLICT_WINDOW_MS as u64),
            reconnect: ReconnectPolicy::default(),
            pairing_timeout: Duration::from_secs(30),
            tombstone_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    /// Sets the conflict window.
    pub fn with_conflict_window(mut self, window: Duration) -> Self {
        self.conflict_window = window;
        self
    }

    /// Sets the reconnection policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the pairing timeout.
    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }

    /// Sets the tombstone retention.
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub(crate) fn conflict_window_ms(&self) -> i64 {
        i64::try_from(self.conflict_window.as_millis()).unwrap_or(i64::MAX)
    }

    pub(crate) fn tombstone_retention_ms(&self) -> i64 {
        i64::try_from(self.tombstone_retention.as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter.
    pub add_jitter: bool,
}

impl ReconnectPolicy {
    /// Creates the default policy: 1s, 2s, 4s, 8s, 16s, then 30s.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    ///
    /// Always within `0..=max_delay` (plus jitter), whatever the multiplier.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let delay_secs = if base_delay.is_nan() {
            max_secs
        } else {
            base_delay.clamp(0.0, max_secs)
        };

        if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}
