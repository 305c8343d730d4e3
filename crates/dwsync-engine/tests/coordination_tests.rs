//! Lock and heartbeat coordination tests over the in-memory store.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dwsync_engine::kv::{KvStore, MemoryStore};
use dwsync_engine::liveness::{LivenessReporter, SystemClock};
use dwsync_engine::lock::LockManager;

#[tokio::test]
async fn many_workers_one_lock_winner() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = LockManager::new(kv.clone(), 3600);
        handles.push(tokio::spawn(async move {
            manager.acquire("orders").await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn lock_lifecycle_over_job_boundaries() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let worker_a = LockManager::new(kv.clone(), 3600);
    let worker_b = LockManager::new(kv.clone(), 3600);

    // Worker A runs a job on "orders"; B is refused and defers.
    assert!(worker_a.acquire("orders").await.unwrap());
    assert!(!worker_b.acquire("orders").await.unwrap());

    // Independent datasets are not serialized.
    assert!(worker_b.acquire("inventory").await.unwrap());

    // A finishes, B's retry (from its scheduler) now succeeds.
    worker_a.release("orders").await.unwrap();
    assert!(worker_b.acquire("orders").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_task_publishes_until_cancelled() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let reporter = LivenessReporter::new(kv.clone(), Arc::new(SystemClock), 30, 60);

    let cancel = CancellationToken::new();
    let handle = reporter.spawn(cancel.clone());

    // Let a few ticks elapse (virtual time).
    tokio::time::sleep(std::time::Duration::from_secs(95)).await;

    let health = reporter.health().await.unwrap();
    assert!(health.is_alive, "fresh heartbeat expected: {}", health.message);
    assert!(health.last_heartbeat.is_some());

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn health_distinguishes_silence_from_staleness() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let reporter = LivenessReporter::new(kv.clone(), Arc::new(SystemClock), 30, 60);

    // No heartbeat was ever written.
    let health = reporter.health().await.unwrap();
    assert!(!health.is_alive);
    assert!(health.last_heartbeat.is_none());

    // A current heartbeat flips it to alive.
    reporter.beat().await.unwrap();
    let health = reporter.health().await.unwrap();
    assert!(health.is_alive);
    assert!(health.last_heartbeat.is_some());
}
