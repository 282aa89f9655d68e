//! Configuration for the sync core.

use std::time::Duration;

/// Top-level configuration, one section per component.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub presence: PresenceConfig,
    pub reconciler: ReconcilerConfig,
    pub activity: ActivityConfig,
    pub snapshot: SnapshotConfig,
}

impl SyncConfig {
    /// Create config from environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            connection: ConnectionConfig::from_env(),
            presence: PresenceConfig::from_env(),
            reconciler: ReconcilerConfig::default(),
            activity: ActivityConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Collaboration server URL
    pub url: String,
    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,
    /// Heartbeat emission interval while connected. A connection with no
    /// inbound traffic for twice this interval is treated as dead.
    pub heartbeat_interval: Duration,
    /// Base delay for exponential reconnect backoff
    pub reconnect_base_delay: Duration,
    /// Upper bound on a single backoff delay
    pub reconnect_max_delay: Duration,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9001/sync".to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

impl ConnectionConfig {
    /// Create config from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("TALLY_SYNC_URL").unwrap_or(defaults.url),
            connect_timeout: env_secs("TALLY_SYNC_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            heartbeat_interval: env_secs("TALLY_SYNC_HEARTBEAT_SECS", defaults.heartbeat_interval),
            reconnect_base_delay: env_secs(
                "TALLY_SYNC_BACKOFF_BASE_SECS",
                defaults.reconnect_base_delay,
            ),
            reconnect_max_delay: env_secs(
                "TALLY_SYNC_BACKOFF_CAP_SECS",
                defaults.reconnect_max_delay,
            ),
            max_reconnect_attempts: std::env::var("TALLY_SYNC_MAX_RECONNECT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_reconnect_attempts),
        }
    }

    /// Backoff delay for the given 1-indexed attempt:
    /// `min(base * 2^(n-1), cap)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.reconnect_max_delay)
    }
}

/// Presence staleness settings.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Records older than this are considered offline
    pub staleness_window: Duration,
    /// How often the session sweeps for stale records
    pub eviction_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(45),
            eviction_interval: Duration::from_secs(15),
        }
    }
}

impl PresenceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            staleness_window: env_secs("TALLY_SYNC_STALENESS_SECS", defaults.staleness_window),
            eviction_interval: defaults.eviction_interval,
        }
    }
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Capacity of the seen-id set used to reject echoes and redeliveries.
    /// Sized to the expected in-flight window.
    pub seen_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            seen_capacity: 1000,
        }
    }
}

/// Activity feed settings.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Maximum retained entries before FIFO eviction
    pub capacity: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Snapshot persistence settings.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Interval between automatic snapshot saves
    pub autosave_interval: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(300),
        }
    }
}

fn env_secs(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.presence.staleness_window, Duration::from_secs(45));
        assert_eq!(config.reconciler.seen_capacity, 1000);
        assert_eq!(config.activity.capacity, 100);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ConnectionConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(5), Duration::from_secs(16));
        // Capped from here on
        assert_eq!(config.backoff_delay(6), Duration::from_secs(30));
        assert_eq!(config.backoff_delay(12), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_zero_attempt_uses_base() {
        let config = ConnectionConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
    }
}
