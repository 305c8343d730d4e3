//! Shared key-value store for locks and heartbeats
//!
//! The lock and liveness coordinators only need four operations, the critical
//! one being atomic set-if-absent with expiry. `RedisStore` is the production
//! backend shared across worker instances; `MemoryStore` backs deterministic
//! tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Minimal key-value contract for coordination state.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically set `key` to `value` with a TTL, only if absent.
    /// Returns true when the key was set by this call.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    /// Unconditional set without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;
}

/// Redis-backed store shared by all workers.
#[derive(Clone)]
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis; the connection manager reconnects on failure.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .context("SET NX EX failed")?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .context("SET failed")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("GET failed")?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("DEL failed")?;
        Ok(())
    }
}

/// In-memory store honoring expiry, for tests and single-process runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(
        entries: &mut HashMap<String, (String, Option<Instant>)>,
        key: &str,
    ) -> Option<String> {
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            (
                value.to_string(),
                Some(Instant::now() + Duration::from_secs(ttl_secs)),
            ),
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::live_value(&mut entries, key))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_is_exclusive() {
        let store = MemoryStore::new();

        assert!(store.set_nx_ex("k", "a", 60).await.unwrap());
        assert!(!store.set_nx_ex("k", "b", 60).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_del_releases_key() {
        let store = MemoryStore::new();

        store.set_nx_ex("k", "a", 60).await.unwrap();
        store.del("k").await.unwrap();
        assert!(store.set_nx_ex("k", "b", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_key_can_be_reacquired() {
        let store = MemoryStore::new();

        assert!(store.set_nx_ex("k", "a", 0).await.unwrap());
        // TTL of zero expires immediately.
        assert!(store.set_nx_ex("k", "b", 60).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_plain_set_has_no_expiry() {
        let store = MemoryStore::new();

        store.set("hb", "2026-08-06T00:00:00Z").await.unwrap();
        assert_eq!(
            store.get("hb").await.unwrap().as_deref(),
            Some("2026-08-06T00:00:00Z")
        );
    }
}
