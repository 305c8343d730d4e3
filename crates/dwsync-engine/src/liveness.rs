//! Worker liveness reporting
//!
//! A single process-wide heartbeat timestamp, refreshed on its own timer
//! regardless of job activity. External health checks read the key directly;
//! staleness means the worker process is gone or hung, independent of what any
//! job's status row says.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kv::KvStore;

const HEARTBEAT_KEY: &str = "dwsync:worker:heartbeat";

/// Injectable time source so staleness tests are deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Health verdict derived from the last published heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub is_alive: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub message: String,
}

/// Publishes and inspects the worker heartbeat. Constructed once per worker
/// process and handed to whoever needs liveness.
#[derive(Clone)]
pub struct LivenessReporter {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
    stale_after_secs: i64,
}

impl LivenessReporter {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        interval_secs: u64,
        stale_after_secs: i64,
    ) -> Self {
        Self {
            kv,
            clock,
            interval_secs,
            stale_after_secs,
        }
    }

    /// Publish the current timestamp under the heartbeat key.
    pub async fn beat(&self) -> Result<()> {
        let now = self.clock.now().to_rfc3339();
        self.kv.set(HEARTBEAT_KEY, &now).await
    }

    /// Read the last heartbeat and judge staleness. "Never reported" is
    /// distinct from "stopped reporting": the former has no timestamp at all.
    pub async fn health(&self) -> Result<WorkerHealth> {
        let raw = self.kv.get(HEARTBEAT_KEY).await?;

        let Some(raw) = raw else {
            return Ok(WorkerHealth {
                is_alive: false,
                last_heartbeat: None,
                message: "worker has never reported a heartbeat".to_string(),
            });
        };

        let last = DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| anyhow::anyhow!("unparseable heartbeat {raw:?}: {e}"))?;

        let age_secs = (self.clock.now() - last).num_seconds();
        if age_secs > self.stale_after_secs {
            Ok(WorkerHealth {
                is_alive: false,
                last_heartbeat: Some(last),
                message: format!("worker stopped reporting {age_secs}s ago"),
            })
        } else {
            Ok(WorkerHealth {
                is_alive: true,
                last_heartbeat: Some(last),
                message: "worker is alive".to_string(),
            })
        }
    }

    /// Spawn the heartbeat task. It runs on its own timer, outside any job's
    /// control flow, until the cancellation token fires.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(reporter.interval_secs));
            info!(
                interval_secs = reporter.interval_secs,
                "Heartbeat task started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reporter.beat().await {
                            warn!(error = %e, "Failed to publish heartbeat");
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("Heartbeat task stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn reporter_at(kv: Arc<dyn KvStore>, now: DateTime<Utc>) -> LivenessReporter {
        LivenessReporter::new(kv, Arc::new(FixedClock(now)), 30, 60)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_754_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_never_reported() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let reporter = reporter_at(kv, t(0));

        let health = reporter.health().await.unwrap();
        assert!(!health.is_alive);
        assert!(health.last_heartbeat.is_none());
        assert!(health.message.contains("never"));
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_alive() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        reporter_at(kv.clone(), t(0)).beat().await.unwrap();

        // 59 seconds later: still inside the 60s threshold.
        let health = reporter_at(kv, t(59)).health().await.unwrap();
        assert!(health.is_alive);
        assert_eq!(health.last_heartbeat, Some(t(0)));
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_dead() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        reporter_at(kv.clone(), t(0)).beat().await.unwrap();

        let health = reporter_at(kv, t(61)).health().await.unwrap();
        assert!(!health.is_alive);
        assert_eq!(health.last_heartbeat, Some(t(0)));
        assert!(health.message.contains("stopped reporting"));
    }

    #[tokio::test]
    async fn test_exactly_at_threshold_is_alive() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        reporter_at(kv.clone(), t(0)).beat().await.unwrap();

        let health = reporter_at(kv, t(60)).health().await.unwrap();
        assert!(health.is_alive);
    }

    #[tokio::test]
    async fn test_beat_overwrites_previous() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        reporter_at(kv.clone(), t(0)).beat().await.unwrap();
        reporter_at(kv.clone(), t(120)).beat().await.unwrap();

        let health = reporter_at(kv, t(130)).health().await.unwrap();
        assert!(health.is_alive);
        assert_eq!(health.last_heartbeat, Some(t(120)));
    }
}
