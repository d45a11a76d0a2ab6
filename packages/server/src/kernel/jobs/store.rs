//! Job storage backends.
//!
//! [`JobStore`] is the persistence seam the repository drives. The Postgres
//! implementation is the production store; the in-memory implementation
//! backs tests and the `memory:` sentinel so the server runs without a
//! database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use thiserror::Error;

use super::job::{GitContext, Job, JobError, JobStatus};

/// Storage-level failure. The repository decides what to do with it.
#[derive(Debug, Error)]
#[error("storage error: {0}")]
pub struct StoreError(pub String);

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError(error.to_string())
    }
}

/// Filter for list/count queries.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub pipeline_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            pipeline_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        if let Some(pipeline_id) = &self.pipeline_id {
            if &job.pipeline_id != pipeline_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        true
    }
}

/// Durable store for job records.
///
/// Single-writer-process semantics: upserts from this process are observed
/// by subsequent reads in program order. No cross-process coordination.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomic upsert by `job_id`.
    async fn upsert(&self, job: &Job) -> Result<(), StoreError>;

    async fn fetch(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Page of matching jobs (newest first) plus the total match count.
    async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), StoreError>;

    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError>;
}

// ============================================================================
// Postgres
// ============================================================================

#[derive(FromRow)]
struct JobRow {
    job_id: String,
    pipeline_id: String,
    status: JobStatus,
    data: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<Json<JobError>>,
    attempts: i32,
    max_retries: i32,
    git_context: Option<Json<GitContext>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            job_id: row.job_id,
            pipeline_id: row.pipeline_id,
            status: row.status,
            data: row.data,
            result: row.result,
            error: row.error.map(|Json(e)| e),
            attempts: row.attempts,
            max_retries: row.max_retries,
            git_context: row.git_context.map(|Json(g)| g),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn upsert(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, pipeline_id, status, data, result, error,
                attempts, max_retries, git_context, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                result = EXCLUDED.result,
                error = EXCLUDED.error,
                attempts = EXCLUDED.attempts,
                git_context = EXCLUDED.git_context,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.pipeline_id)
        .bind(job.status)
        .bind(&job.data)
        .bind(&job.result)
        .bind(job.error.as_ref().map(Json))
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.git_context.as_ref().map(Json))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT job_id, pipeline_id, status, data, result, error,
                   attempts, max_retries, git_context, created_at, started_at, completed_at
            FROM jobs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Job::from))
    }

    async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT job_id, pipeline_id, status, data, result, error,
                   attempts, max_retries, git_context, created_at, started_at, completed_at
            FROM jobs
            WHERE ($1::text IS NULL OR pipeline_id = $1)
              AND ($2::job_status IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(&filter.pipeline_id)
        .bind(filter.status)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        let total = self.count(filter).await?;
        Ok((rows.into_iter().map(Job::from).collect(), total))
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE ($1::text IS NULL OR pipeline_id = $1)
              AND ($2::job_status IS NULL OR status = $2)
            "#,
        )
        .bind(&filter.pipeline_id)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-memory job store.
///
/// Backs tests and the `memory:` configuration sentinel. `set_fail_writes`
/// lets tests simulate a storage outage to exercise degraded mode.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    fail_writes: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force every subsequent `upsert` to fail (or stop doing so).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, job: &Job) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError("simulated storage outage".to_string()));
        }
        self.jobs
            .write()
            .unwrap()
            .insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn fetch(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().unwrap().get(job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), StoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut matching: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        // Newest first; job_id tiebreak keeps paging stable.
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        let total = matching.len() as u64;
        let offset = filter.offset.max(0) as usize;
        let limit = filter.limit.max(0) as usize;
        let page = matching.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs.values().filter(|j| filter.matches(j)).count() as u64)
    }
}
