//! Streaming extract-load pipeline
//!
//! The orchestrator: takes a claimed job, acquires the dataset lock, runs the
//! pre-flight schema check, streams source rows into batched target inserts,
//! and reconciles counts afterwards. Batches are flushed in cursor order;
//! flushed batches are never rolled back (at-least-once per batch, reconciled
//! post-hoc). Cancellation is cooperative and only honored at batch
//! boundaries, so an in-progress batch always lands whole.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, MIN_INSERT_BATCH_SIZE};
use crate::dataset::Dataset;
use crate::job::{JobState, SyncAction};
use crate::lock::LockManager;
use crate::memory::MemoryGuard;
use crate::source::{build_scan_queries, SourcePool};
use crate::status::{JobRecord, JobStore};
use crate::target::ClickHouseClient;
use crate::typemap::SchemaChecker;
use crate::validate::{ConsistencyValidator, DataValidationResult};

/// Receives flushed batches. The production sink writes to the target store;
/// tests substitute a recorder.
#[async_trait]
pub trait BatchSink: Send {
    async fn flush(&mut self, rows: Vec<Map<String, Value>>) -> Result<()>;
}

/// Mutable state threaded through every scan of one job.
#[derive(Debug)]
pub struct LoadState {
    /// Rows flushed to the target so far.
    pub rows_loaded: u64,
    /// Flush operations issued so far.
    pub flushes: usize,
    /// Current batch size; halved under sustained memory pressure.
    pub batch_size: usize,
    /// Whether the previous memory check was already over budget.
    over_budget: bool,
    /// Set once cancellation was honored; no further batch may start.
    pub cancelled: bool,
}

impl LoadState {
    pub fn new(batch_size: usize) -> Self {
        Self {
            rows_loaded: 0,
            flushes: 0,
            batch_size,
            over_budget: false,
            cancelled: false,
        }
    }
}

/// Limits applied across all scans of one job.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    /// Memory check cadence, in flushed batches.
    pub memory_check_every: usize,
    /// Job-level cap on extracted rows, if any.
    pub row_limit: Option<u64>,
}

/// Drain one source scan into the sink under the batching rules.
///
/// Rows accumulate into a write buffer of `state.batch_size`; full buffers are
/// flushed as one batch. The cancellation token is inspected only when the
/// buffer is empty (the batch boundary), so a signal raised mid-batch lets
/// that batch complete and merely prevents the next one from starting. Every
/// `memory_check_every` flushes the guard is consulted; a reading over budget
/// triggers a reclaim hint, and a second consecutive one halves the remaining
/// batch size.
pub async fn drain_scan<S>(
    mut rows: S,
    sink: &mut dyn BatchSink,
    state: &mut LoadState,
    settings: &BatchSettings,
    memory: &MemoryGuard,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<Map<String, Value>>> + Unpin,
{
    let mut buffer: Vec<Map<String, Value>> = Vec::with_capacity(state.batch_size);

    loop {
        if buffer.is_empty() {
            if cancel.is_cancelled() {
                state.cancelled = true;
                return Ok(());
            }
            if let Some(limit) = settings.row_limit {
                if state.rows_loaded >= limit {
                    return Ok(());
                }
            }
        }

        let Some(row) = rows.next().await else {
            break;
        };
        buffer.push(row?);

        let limit_hit = settings
            .row_limit
            .is_some_and(|limit| state.rows_loaded + buffer.len() as u64 >= limit);

        if buffer.len() >= state.batch_size || limit_hit {
            flush_buffer(&mut buffer, sink, state, settings, memory).await?;
            if limit_hit {
                return Ok(());
            }
        }
    }

    if !buffer.is_empty() {
        flush_buffer(&mut buffer, sink, state, settings, memory).await?;
    }
    Ok(())
}

async fn flush_buffer(
    buffer: &mut Vec<Map<String, Value>>,
    sink: &mut dyn BatchSink,
    state: &mut LoadState,
    settings: &BatchSettings,
    memory: &MemoryGuard,
) -> Result<()> {
    let batch = std::mem::take(buffer);
    let rows = batch.len() as u64;
    sink.flush(batch).await?;
    state.rows_loaded += rows;
    state.flushes += 1;

    if state.flushes % settings.memory_check_every == 0 {
        let status = memory.check();
        if !status.ok {
            memory.force_reclaim();
            if state.over_budget && state.batch_size > MIN_INSERT_BATCH_SIZE {
                let halved = (state.batch_size / 2).max(MIN_INSERT_BATCH_SIZE);
                warn!(
                    used_mb = status.used_mb,
                    from = state.batch_size,
                    to = halved,
                    "Memory pressure persists; halving batch size"
                );
                state.batch_size = halved;
            }
            state.over_budget = true;
        } else {
            state.over_budget = false;
        }
    }
    Ok(())
}

/// Rename a source-keyed row into target column names per the dataset
/// mapping. Unmapped extras are dropped; mapped columns missing from the row
/// become nulls.
pub fn project_row(mut row: Map<String, Value>, dataset: &Dataset) -> Map<String, Value> {
    let mut out = Map::with_capacity(dataset.columns.len());
    for mapping in &dataset.columns {
        let value = row.remove(&mapping.source_column).unwrap_or(Value::Null);
        out.insert(mapping.target_column.clone(), value);
    }
    out
}

/// Production sink: batched inserts into the target table, with job progress
/// recorded after every flush.
struct TargetSink<'a> {
    target: &'a ClickHouseClient,
    table: &'a str,
    columns: Vec<String>,
    jobs: &'a JobStore,
    job_id: Uuid,
    loaded: u64,
}

#[async_trait]
impl BatchSink for TargetSink<'_> {
    async fn flush(&mut self, rows: Vec<Map<String, Value>>) -> Result<()> {
        let count = rows.len() as u64;
        self.target
            .insert_rows(self.table, &self.columns, &rows)
            .await
            .context("Target batch insert failed")?;
        self.loaded += count;

        // Progress is an audit aid; a failed update must not abort the load.
        if let Err(e) = self.jobs.update_progress(self.job_id, self.loaded as i64).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to record job progress");
        }
        Ok(())
    }
}

/// Terminal summary of one pipeline run.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub job_id: Uuid,
    pub state: JobState,
    pub rows_loaded: u64,
    pub validation: Option<DataValidationResult>,
    pub error: Option<String>,
}

/// The extract-load orchestrator. One instance per worker; runs one job at a
/// time, with cross-dataset concurrency coming from additional workers and
/// the per-dataset lock as the unit of exclusion.
pub struct SyncPipeline {
    jobs: JobStore,
    locks: LockManager,
    schema: SchemaChecker,
    validator: ConsistencyValidator,
    target: ClickHouseClient,
    memory: MemoryGuard,
    config: EngineConfig,
}

impl SyncPipeline {
    pub fn new(
        jobs: JobStore,
        locks: LockManager,
        target: ClickHouseClient,
        memory: MemoryGuard,
        config: EngineConfig,
    ) -> Self {
        Self {
            jobs,
            locks,
            schema: SchemaChecker::new(target.clone()),
            validator: ConsistencyValidator::new(target.clone()),
            target,
            memory,
            config,
        }
    }

    /// Run one claimed job to a terminal state. The job row is updated on
    /// every path; the dataset lock is held from before the first read until
    /// after reconciliation.
    pub async fn run(
        &self,
        job: &JobRecord,
        dataset: &Dataset,
        source: &SourcePool,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        if let Err(e) = job.request.validate() {
            let message = format!("malformed job: {e}");
            self.jobs.fail(job.id, &message).await?;
            return Ok(self.outcome(job.id, JobState::Failed, 0, None, Some(message)));
        }

        if !self.locks.acquire(&dataset.id).await? {
            let message = format!("dataset {} is locked by another worker", dataset.id);
            info!(job_id = %job.id, dataset_id = %dataset.id, "Job rejected: lock held");
            self.jobs.fail(job.id, &message).await?;
            return Ok(self.outcome(job.id, JobState::Failed, 0, None, Some(message)));
        }

        let result = self.run_locked(job, dataset, source, cancel).await;
        if let Err(e) = self.locks.release(&dataset.id).await {
            warn!(dataset_id = %dataset.id, error = %e, "Failed to release dataset lock");
        }
        result
    }

    async fn run_locked(
        &self,
        job: &JobRecord,
        dataset: &Dataset,
        source: &SourcePool,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let validation = self.schema.validate(dataset).await;
        if let Some(warning) = &validation.warning {
            warn!(job_id = %job.id, warning = %warning, "Schema validation skipped");
        }
        if !validation.valid {
            let message = format!("schema mismatch: {}", validation.summary());
            self.jobs.fail(job.id, &message).await?;
            return Ok(self.outcome(job.id, JobState::Failed, 0, None, Some(message)));
        }

        if job.action == SyncAction::FullRefresh {
            self.target
                .truncate(&dataset.target_table)
                .await
                .context("Failed to clear target for full refresh")?;
            info!(job_id = %job.id, table = %dataset.target_table, "Target cleared for full refresh");
        }

        let load = self.stream_load(job, dataset, source, cancel).await;

        match load {
            Ok(state) if state.cancelled => {
                info!(job_id = %job.id, rows = state.rows_loaded, "Job cancelled at batch boundary");
                self.jobs.cancel(job.id, state.rows_loaded as i64).await?;
                Ok(self.outcome(job.id, JobState::Cancelled, state.rows_loaded, None, None))
            }
            Ok(state) => {
                let validation = self.validator.reconcile(dataset, state.rows_loaded).await;
                if !validation.is_consistent {
                    warn!(job_id = %job.id, message = %validation.message, "Row counts inconsistent after load");
                }
                let validation_json = serde_json::to_value(&validation).ok();
                self.jobs
                    .complete(job.id, state.rows_loaded as i64, validation_json)
                    .await?;
                info!(
                    job_id = %job.id,
                    rows = state.rows_loaded,
                    flushes = state.flushes,
                    "Job completed"
                );
                Ok(self.outcome(
                    job.id,
                    JobState::Completed,
                    state.rows_loaded,
                    Some(validation),
                    None,
                ))
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.jobs.fail(job.id, &message).await?;
                Ok(self.outcome(job.id, JobState::Failed, 0, None, Some(message)))
            }
        }
    }

    async fn stream_load(
        &self,
        job: &JobRecord,
        dataset: &Dataset,
        source: &SourcePool,
        cancel: &CancellationToken,
    ) -> Result<LoadState> {
        let scans = build_scan_queries(
            dataset,
            &job.request,
            self.config.incremental_window_days,
            Utc::now().date_naive(),
            source.dialect(),
        )?;

        let mut sink = TargetSink {
            target: &self.target,
            table: &dataset.target_table,
            columns: dataset
                .columns
                .iter()
                .map(|c| c.target_column.clone())
                .collect(),
            jobs: &self.jobs,
            job_id: job.id,
            loaded: 0,
        };

        let settings = BatchSettings {
            memory_check_every: self.config.memory_check_every,
            row_limit: job.request.limit,
        };
        let mut state = LoadState::new(self.config.insert_batch_size);

        for scan in &scans {
            if state.cancelled {
                break;
            }
            if let Some(limit) = settings.row_limit {
                if state.rows_loaded >= limit {
                    break;
                }
            }

            info!(job_id = %job.id, scan = %scan.description, "Opening source scan");
            // Cursor read-ahead: pull fixed-size chunks off the wire so the
            // resident set stays bounded by chunk + batch, not the result set.
            let rows = source
                .stream(&scan.sql)
                .chunks(self.config.fetch_chunk_size)
                .flat_map(futures::stream::iter)
                .map(|row| row.map(|r| project_row(r, dataset)));
            futures::pin_mut!(rows);

            drain_scan(rows, &mut sink, &mut state, &settings, &self.memory, cancel)
                .await
                .with_context(|| format!("scan failed: {}", scan.description))?;
        }

        Ok(state)
    }

    fn outcome(
        &self,
        job_id: Uuid,
        state: JobState,
        rows_loaded: u64,
        validation: Option<DataValidationResult>,
        error: Option<String>,
    ) -> SyncOutcome {
        SyncOutcome {
            job_id,
            state,
            rows_loaded,
            validation,
            error,
        }
    }
}
