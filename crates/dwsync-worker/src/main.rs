//! DWSync worker - Main entry point
//!
//! Claims pending sync jobs from the status store and runs them through the
//! streaming pipeline, one at a time. The heartbeat task runs on its own
//! timer for the whole process lifetime; a cooperative shutdown signal lets
//! an in-flight job reach `cancelled` at the next batch boundary.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dwsync_common::logging::{init_logging, LogConfig};
use dwsync_engine::dataset::DatasetCatalog;
use dwsync_engine::kv::{KvStore, RedisStore};
use dwsync_engine::liveness::{LivenessReporter, SystemClock};
use dwsync_engine::lock::LockManager;
use dwsync_engine::memory::MemoryGuard;
use dwsync_engine::source::SourcePool;
use dwsync_engine::status::{JobRecord, JobStore};
use dwsync_engine::target::ClickHouseClient;
use dwsync_engine::SyncPipeline;

use config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env_or(
        LogConfig::default()
            .with_prefix("dwsync-worker")
            .with_filter("dwsync_engine=debug,sqlx=warn"),
    )?;
    init_logging(&log_config)?;

    info!("Starting dwsync worker");

    let config = WorkerConfig::load()?;

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;
    info!("Status store connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    info!("Database migrations completed");

    let kv: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    info!("Lock/heartbeat store connected");

    let jobs = JobStore::new(db_pool.clone());
    let catalog = DatasetCatalog::new(db_pool.clone());

    // Jobs left running past the lock TTL belong to a dead worker.
    let reclaimed = jobs.reclaim_stale(config.engine.lock_ttl_secs).await?;
    if reclaimed > 0 {
        warn!(reclaimed, "Failed stale jobs from a previous worker");
    }

    let cancel = CancellationToken::new();

    let liveness = LivenessReporter::new(
        kv.clone(),
        Arc::new(SystemClock),
        config.engine.heartbeat_interval_secs,
        config.engine.heartbeat_stale_secs,
    );
    let heartbeat_handle = liveness.spawn(cancel.clone());

    let memory = MemoryGuard::process(config.engine.memory_limit_mb);
    spawn_memory_watch(memory.clone(), cancel.clone());

    let pipeline = SyncPipeline::new(
        jobs.clone(),
        LockManager::new(kv, config.engine.lock_ttl_secs),
        ClickHouseClient::new(config.clickhouse.clone()),
        memory,
        config.engine.clone(),
    );

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested; finishing at the next batch boundary");
        shutdown.cancel();
    });

    run_intake_loop(&config, &jobs, &catalog, &pipeline, &cancel).await;

    heartbeat_handle.await.ok();
    info!("Worker shut down");
    Ok(())
}

/// Poll for pending jobs and run them one at a time until shutdown.
async fn run_intake_loop(
    config: &WorkerConfig,
    jobs: &JobStore,
    catalog: &DatasetCatalog,
    pipeline: &SyncPipeline,
    cancel: &CancellationToken,
) {
    let mut poll = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
    info!(
        poll_interval_secs = config.poll_interval_secs,
        "Intake loop started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => {}
        }

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let job = match jobs.claim_next().await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to claim next job");
                    break;
                }
            };

            info!(
                job_id = %job.id,
                dataset_id = %job.dataset_id,
                action = %job.action,
                "Claimed job"
            );

            if let Err(e) = process_job(&job, jobs, catalog, pipeline, cancel).await {
                error!(job_id = %job.id, error = %e, "Job processing error");
            }
        }
    }
}

/// Resolve the job's dataset and source connection, then hand it to the
/// pipeline. Resolution failures are pre-flight: the job fails before any
/// row is read.
async fn process_job(
    job: &JobRecord,
    jobs: &JobStore,
    catalog: &DatasetCatalog,
    pipeline: &SyncPipeline,
    cancel: &CancellationToken,
) -> Result<()> {
    let dataset = match catalog.load(&job.dataset_id).await {
        Ok(dataset) => dataset,
        Err(e) => {
            jobs.fail(job.id, &format!("dataset resolution failed: {e}")).await?;
            return Ok(());
        }
    };

    let source = match SourcePool::connect(&dataset.source_url).await {
        Ok(source) => source,
        Err(e) => {
            jobs.fail(job.id, &format!("source connection failed: {e}")).await?;
            return Ok(());
        }
    };

    let outcome = pipeline.run(job, &dataset, &source, cancel).await;
    source.close().await;

    let outcome = outcome?;
    info!(
        job_id = %outcome.job_id,
        state = %outcome.state.as_str(),
        rows = outcome.rows_loaded,
        "Job finished"
    );
    Ok(())
}

/// Periodic memory reading on its own timer, decoupled from job control
/// flow. The pipeline still consults the guard between batches; this keeps
/// over-budget readings visible even while no job runs.
fn spawn_memory_watch(memory: MemoryGuard, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // check() logs a warning when usage exceeds the ceiling.
                    let _ = memory.check();
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
