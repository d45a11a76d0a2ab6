//! Job model for pipeline execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::kernel::classifier::{WorkerError, WorkerErrorKind};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal statuses are final; no transitions leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// ============================================================================
// Structured payloads
// ============================================================================

/// Structured failure payload persisted with a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl JobError {
    pub fn from_worker(error: &WorkerError) -> Self {
        Self {
            message: error.message.clone(),
            code: error.code.clone(),
            stack: error.stack.clone(),
            cancelled: error.kind == WorkerErrorKind::Cancelled,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
            cancelled: true,
        }
    }
}

/// Optional git workflow metadata attached to a job. Opaque to the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

// ============================================================================
// Job Model
// ============================================================================

/// Generate a fresh server-side job identifier.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short identifier used in log lines and branch names.
pub fn short_id(job_id: &str) -> &str {
    &job_id[..job_id.len().min(8)]
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = new_job_id())]
    pub job_id: String,

    pub pipeline_id: String,

    #[builder(default)]
    pub status: JobStatus,

    /// Opaque input blob. Immutable after creation.
    #[builder(default = serde_json::json!({}))]
    pub data: serde_json::Value,

    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,

    #[builder(default, setter(strip_option))]
    pub error: Option<JobError>,

    /// Incremented before each execution; never exceeds `max_retries + 1`.
    #[builder(default = 0)]
    pub attempts: i32,

    #[builder(default = 3)]
    pub max_retries: i32,

    #[builder(default, setter(strip_option))]
    pub git_context: Option<GitContext>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Mark the start of an execution attempt.
    ///
    /// `started_at` is set on the first transition to running only, which
    /// keeps `created_at <= started_at <= completed_at`.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.status = JobStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Put the job back in the queue for a retry attempt.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Queued;
    }

    pub fn finish_success(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub fn finish_failure(&mut self, error: JobError) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Create a fresh job re-running this one's input. Only meaningful for
    /// failed jobs; the caller enforces that.
    pub fn retry_of(&self) -> Self {
        Self {
            job_id: new_job_id(),
            pipeline_id: self.pipeline_id.clone(),
            status: JobStatus::Queued,
            data: self.data.clone(),
            result: None,
            error: None,
            attempts: 0,
            max_retries: self.max_retries,
            git_context: self.git_context.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Wall-clock duration from start to completion, when both are known.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).num_milliseconds().try_into().ok()
    }
}
