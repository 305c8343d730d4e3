//! Engine configuration
//!
//! Tunables for the streaming pipeline and its collaborators. Everything is
//! environment-driven with documented defaults, following the same
//! `from_env` / `validate` convention as the worker configuration.

use serde::{Deserialize, Serialize};

/// Default streaming read-ahead: rows fetched per cursor chunk.
pub const DEFAULT_FETCH_CHUNK_SIZE: usize = 10_000;

/// Default insert batch: rows per flush into the target store.
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 5_000;

/// Smallest batch size the back-off is allowed to reach.
pub const MIN_INSERT_BATCH_SIZE: usize = 500;

/// Default number of flushed batches between memory checks.
pub const DEFAULT_MEMORY_CHECK_EVERY: usize = 10;

/// Default process memory ceiling in megabytes.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 1024;

/// Default per-dataset lock time-to-live in seconds (crash ceiling, not an
/// expected job duration).
pub const DEFAULT_LOCK_TTL_SECS: u64 = 3600;

/// Default heartbeat publish cadence in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default heartbeat staleness threshold in seconds.
pub const DEFAULT_HEARTBEAT_STALE_SECS: i64 = 60;

/// Default window for incremental and manual syncs, in days.
pub const DEFAULT_INCREMENTAL_WINDOW_DAYS: u32 = 3;

/// Engine tunables shared by the pipeline and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rows fetched per streaming cursor chunk.
    pub fetch_chunk_size: usize,
    /// Rows accumulated before a batch insert is flushed.
    pub insert_batch_size: usize,
    /// Memory check cadence, in flushed batches.
    pub memory_check_every: usize,
    /// Process memory ceiling in megabytes.
    pub memory_limit_mb: u64,
    /// Per-dataset lock TTL in seconds.
    pub lock_ttl_secs: u64,
    /// Heartbeat publish cadence in seconds.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat staleness threshold in seconds.
    pub heartbeat_stale_secs: i64,
    /// Window for incremental/manual syncs, in days.
    pub incremental_window_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_chunk_size: DEFAULT_FETCH_CHUNK_SIZE,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            memory_check_every: DEFAULT_MEMORY_CHECK_EVERY,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            heartbeat_stale_secs: DEFAULT_HEARTBEAT_STALE_SECS,
            incremental_window_days: DEFAULT_INCREMENTAL_WINDOW_DAYS,
        }
    }
}

impl EngineConfig {
    /// Load tunables from `DWSYNC_*` environment variables, using defaults for
    /// anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            fetch_chunk_size: env_parse("DWSYNC_FETCH_CHUNK_SIZE", DEFAULT_FETCH_CHUNK_SIZE),
            insert_batch_size: env_parse("DWSYNC_INSERT_BATCH_SIZE", DEFAULT_INSERT_BATCH_SIZE),
            memory_check_every: env_parse("DWSYNC_MEMORY_CHECK_EVERY", DEFAULT_MEMORY_CHECK_EVERY),
            memory_limit_mb: env_parse("DWSYNC_MEMORY_LIMIT_MB", DEFAULT_MEMORY_LIMIT_MB),
            lock_ttl_secs: env_parse("DWSYNC_LOCK_TTL_SECS", DEFAULT_LOCK_TTL_SECS),
            heartbeat_interval_secs: env_parse(
                "DWSYNC_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            ),
            heartbeat_stale_secs: env_parse(
                "DWSYNC_HEARTBEAT_STALE_SECS",
                DEFAULT_HEARTBEAT_STALE_SECS,
            ),
            incremental_window_days: env_parse(
                "DWSYNC_INCREMENTAL_WINDOW_DAYS",
                DEFAULT_INCREMENTAL_WINDOW_DAYS,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fetch_chunk_size == 0 {
            anyhow::bail!("DWSYNC_FETCH_CHUNK_SIZE must be greater than 0");
        }
        if self.insert_batch_size == 0 {
            anyhow::bail!("DWSYNC_INSERT_BATCH_SIZE must be greater than 0");
        }
        if self.memory_check_every == 0 {
            anyhow::bail!("DWSYNC_MEMORY_CHECK_EVERY must be greater than 0");
        }
        if self.memory_limit_mb == 0 {
            anyhow::bail!("DWSYNC_MEMORY_LIMIT_MB must be greater than 0");
        }
        if self.lock_ttl_secs == 0 {
            anyhow::bail!("DWSYNC_LOCK_TTL_SECS must be greater than 0");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("DWSYNC_HEARTBEAT_INTERVAL_SECS must be greater than 0");
        }
        if self.heartbeat_stale_secs <= 0 {
            anyhow::bail!("DWSYNC_HEARTBEAT_STALE_SECS must be greater than 0");
        }
        if self.incremental_window_days == 0 {
            anyhow::bail!("DWSYNC_INCREMENTAL_WINDOW_DAYS must be greater than 0");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.fetch_chunk_size, 10_000);
        assert_eq!(config.insert_batch_size, 5_000);
        assert_eq!(config.memory_check_every, 10);
        assert_eq!(config.memory_limit_mb, 1024);
        assert_eq!(config.lock_ttl_secs, 3600);
        assert_eq!(config.heartbeat_stale_secs, 60);
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let config = EngineConfig {
            insert_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_window() {
        let config = EngineConfig {
            incremental_window_days: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
