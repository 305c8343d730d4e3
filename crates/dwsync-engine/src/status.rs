//! Job status store
//!
//! Persists the job lifecycle as queryable rows in the relational catalog:
//! intake inserts a `pending` row, the worker claims it atomically, and every
//! transition lands here so dashboards never depend on the worker's in-memory
//! state. Terminal rows are immutable audit records.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::job::{JobState, SyncAction, SyncRequest};

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub dataset_id: String,
    pub action: SyncAction,
    pub status: JobState,
    pub rows_processed: i64,
    pub triggered_by: Option<Uuid>,
    /// The original request, kept verbatim for the pipeline and for audit.
    pub request: SyncRequest,
    pub error_message: Option<String>,
    /// Reconciliation result attached after load.
    pub validation: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    dataset_id: String,
    action: String,
    status: String,
    rows_processed: i64,
    triggered_by: Option<Uuid>,
    payload: serde_json::Value,
    error_message: Option<String>,
    validation: Option<serde_json::Value>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(JobRecord {
            id: row.id,
            dataset_id: row.dataset_id,
            action: row.action.parse()?,
            status: row.status.parse()?,
            rows_processed: row.rows_processed,
            triggered_by: row.triggered_by,
            request: serde_json::from_value(row.payload)
                .context("Malformed job payload in status store")?,
            error_message: row.error_message,
            validation: row.validation,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, dataset_id, action, status, rows_processed, triggered_by, \
     payload, error_message, validation, started_at, completed_at, created_at";

/// Reads and writes the `sync_jobs` table.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a validated request as a pending job and return its id.
    /// Callers must run [`SyncRequest::validate`] first; intake rejects
    /// malformed requests without creating any row.
    pub async fn create(&self, request: &SyncRequest) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let payload = serde_json::to_value(request).context("Failed to encode job payload")?;

        sqlx::query(
            r#"
            INSERT INTO sync_jobs (id, dataset_id, action, status, triggered_by, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job_id)
        .bind(&request.dataset_id)
        .bind(request.action.as_str())
        .bind(JobState::Pending.as_str())
        .bind(request.triggered_by)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("Failed to create sync job")?;

        Ok(job_id)
    }

    /// Atomically claim the oldest pending job, marking it running. Returns
    /// None when the queue is empty. Safe under concurrent workers via
    /// `FOR UPDATE SKIP LOCKED`.
    pub async fn claim_next(&self) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'running', started_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM sync_jobs
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim next job")?;

        row.map(JobRecord::try_from).transpose()
    }

    /// Record progress on a running job.
    pub async fn update_progress(&self, job_id: Uuid, rows_processed: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET rows_processed = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(rows_processed)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to update job progress")?;
        Ok(())
    }

    /// Mark a running job completed, attaching the reconciliation result.
    pub async fn complete(
        &self,
        job_id: Uuid,
        rows_processed: i64,
        validation: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'completed', rows_processed = $1, validation = $2,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $3 AND status = 'running'
            "#,
        )
        .bind(rows_processed)
        .bind(validation)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job completed")?;
        Ok(())
    }

    /// Mark a running job failed with a reason.
    pub async fn fail(&self, job_id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', error_message = $1,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job failed")?;
        Ok(())
    }

    /// Mark a running job cancelled, keeping the rows already written.
    pub async fn cancel(&self, job_id: Uuid, rows_processed: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'cancelled', rows_processed = $1,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(rows_processed)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job cancelled")?;
        Ok(())
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch job")?;

        row.map(JobRecord::try_from).transpose()
    }

    /// Most recent jobs, newest first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list jobs")?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    /// Fail `running` jobs whose last update is older than `max_age_secs`.
    /// Run at worker startup: a job left running past the lock TTL means its
    /// worker died mid-flight.
    pub async fn reclaim_stale(&self, max_age_secs: u64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed',
                error_message = 'worker lost before completion',
                completed_at = NOW(), updated_at = NOW()
            WHERE status = 'running'
              AND updated_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(max_age_secs as f64)
        .execute(&self.pool)
        .await
        .context("Failed to reclaim stale jobs")?;

        Ok(result.rows_affected())
    }
}
