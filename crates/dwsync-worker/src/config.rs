//! Worker configuration

use serde::{Deserialize, Serialize};

use dwsync_engine::config::EngineConfig;
use dwsync_engine::target::ClickHouseConfig;

/// Default relational store for job status and the dataset catalog.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/dwsync";

/// Default lock/heartbeat store.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default intake poll cadence in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default maximum connections in the status-store pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Job status store and dataset catalog.
    pub database_url: String,
    pub database_max_connections: u32,
    /// Shared lock/heartbeat key-value store.
    pub redis_url: String,
    /// How often the intake loop polls for pending jobs.
    pub poll_interval_secs: u64,
    pub clickhouse: ClickHouseConfig,
    pub engine: EngineConfig,
}

impl WorkerConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            redis_url: std::env::var("DWSYNC_REDIS_URL")
                .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            poll_interval_secs: std::env::var("DWSYNC_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            clickhouse: ClickHouseConfig::from_env()?,
            engine: EngineConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("DATABASE_URL cannot be empty");
        }
        if self.redis_url.is_empty() {
            anyhow::bail!("DWSYNC_REDIS_URL cannot be empty");
        }
        if self.database_max_connections == 0 {
            anyhow::bail!("DATABASE_MAX_CONNECTIONS must be greater than 0");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("DWSYNC_POLL_INTERVAL_SECS must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let config = WorkerConfig {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_max_connections: 5,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            poll_interval_secs: 0,
            clickhouse: ClickHouseConfig::default(),
            engine: EngineConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_accepts_defaults() {
        let config = WorkerConfig {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            clickhouse: ClickHouseConfig::default(),
            engine: EngineConfig::default(),
        };
        assert!(config.validate().is_ok());
    }
}
