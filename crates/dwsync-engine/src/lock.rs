//! Per-dataset exclusive locks
//!
//! One sync job per dataset at a time, across all workers. Acquisition is
//! non-blocking and fail-fast: retry cadence belongs to whoever triggered the
//! job. The TTL bounds the damage of a crashed holder; it is not an estimate
//! of job duration.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::kv::KvStore;

const LOCK_KEY_PREFIX: &str = "dwsync:lock:";

/// Coordinates per-dataset locks through the shared key-value store.
#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    ttl_secs: u64,
    /// Owner token stored under the lock key, so release never removes a lock
    /// some other worker re-acquired after our TTL expired.
    owner: String,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            kv,
            ttl_secs,
            owner: format!("{}:{}", host, Uuid::new_v4()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn key(dataset_id: &str) -> String {
        format!("{LOCK_KEY_PREFIX}{dataset_id}")
    }

    /// Try to take the dataset lock. Returns false without waiting when the
    /// lock is already held.
    pub async fn acquire(&self, dataset_id: &str) -> Result<bool> {
        let acquired = self
            .kv
            .set_nx_ex(&Self::key(dataset_id), &self.owner, self.ttl_secs)
            .await?;
        if acquired {
            debug!(dataset_id, owner = %self.owner, "Dataset lock acquired");
        } else {
            debug!(dataset_id, "Dataset lock already held");
        }
        Ok(acquired)
    }

    /// Release the dataset lock if this worker still owns it.
    pub async fn release(&self, dataset_id: &str) -> Result<()> {
        let key = Self::key(dataset_id);
        match self.kv.get(&key).await? {
            Some(holder) if holder == self.owner => {
                self.kv.del(&key).await?;
                debug!(dataset_id, "Dataset lock released");
            }
            Some(holder) => {
                warn!(
                    dataset_id,
                    holder = %holder,
                    "Lock no longer owned by this worker; leaving it in place"
                );
            }
            None => {
                debug!(dataset_id, "Lock already expired before release");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn manager(kv: Arc<dyn KvStore>) -> LockManager {
        LockManager::new(kv, 3600)
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone());
        let b = manager(kv.clone());

        let (got_a, got_b) =
            tokio::join!(a.acquire("sales"), b.acquire("sales"));
        let got_a = got_a.unwrap();
        let got_b = got_b.unwrap();

        // Exactly one of the two concurrent acquires wins.
        assert!(got_a ^ got_b);
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone());
        let b = manager(kv.clone());

        assert!(a.acquire("sales").await.unwrap());
        assert!(!b.acquire("sales").await.unwrap());

        a.release("sales").await.unwrap();
        assert!(b.acquire("sales").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_does_not_steal_foreign_lock() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone());
        let b = manager(kv.clone());

        assert!(a.acquire("sales").await.unwrap());
        // b never held the lock; its release must not free a's.
        b.release("sales").await.unwrap();
        assert!(!b.acquire("sales").await.unwrap());
    }

    #[tokio::test]
    async fn test_independent_datasets_do_not_contend() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone());
        let b = manager(kv.clone());

        assert!(a.acquire("sales").await.unwrap());
        assert!(b.acquire("inventory").await.unwrap());
    }
}
