//! Job lifecycle events.
//!
//! Events are facts about the job lifecycle, not commands. They are
//! immutable once emitted and flow through the event hub to streaming
//! subscribers. For any single job, emitted events form a prefix of
//! `created, started, progress*, {completed | failed}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Job, JobError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// A job record was created and enqueued.
    #[serde(rename = "job:created")]
    Created {
        pipeline_id: String,
        job_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Execution started (first attempt).
    #[serde(rename = "job:started")]
    Started {
        pipeline_id: String,
        job_id: String,
        timestamp: DateTime<Utc>,
        attempt: i32,
    },

    /// Mid-flight progress; retries are announced here with a `retry` payload.
    #[serde(rename = "job:progress")]
    Progress {
        pipeline_id: String,
        job_id: String,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    },

    /// Terminal success.
    #[serde(rename = "job:completed")]
    Completed {
        pipeline_id: String,
        job_id: String,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    /// Terminal failure (including cancellation).
    #[serde(rename = "job:failed")]
    Failed {
        pipeline_id: String,
        job_id: String,
        timestamp: DateTime<Utc>,
        error: JobError,
        attempts: i32,
    },
}

impl JobEvent {
    pub fn created(job: &Job) -> Self {
        Self::Created {
            pipeline_id: job.pipeline_id.clone(),
            job_id: job.job_id.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn started(job: &Job) -> Self {
        Self::Started {
            pipeline_id: job.pipeline_id.clone(),
            job_id: job.job_id.clone(),
            timestamp: Utc::now(),
            attempt: job.attempts,
        }
    }

    pub fn progress(job: &Job, payload: serde_json::Value) -> Self {
        Self::Progress {
            pipeline_id: job.pipeline_id.clone(),
            job_id: job.job_id.clone(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn completed(job: &Job) -> Self {
        Self::Completed {
            pipeline_id: job.pipeline_id.clone(),
            job_id: job.job_id.clone(),
            timestamp: Utc::now(),
            result: job.result.clone(),
            duration_ms: job.duration_ms(),
        }
    }

    pub fn failed(job: &Job, error: JobError) -> Self {
        Self::Failed {
            pipeline_id: job.pipeline_id.clone(),
            job_id: job.job_id.clone(),
            timestamp: Utc::now(),
            error,
            attempts: job.attempts,
        }
    }

    /// Stable wire tag (`job:created`, `job:started`, ...).
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Created { .. } => "job:created",
            JobEvent::Started { .. } => "job:started",
            JobEvent::Progress { .. } => "job:progress",
            JobEvent::Completed { .. } => "job:completed",
            JobEvent::Failed { .. } => "job:failed",
        }
    }

    pub fn pipeline_id(&self) -> &str {
        match self {
            JobEvent::Created { pipeline_id, .. }
            | JobEvent::Started { pipeline_id, .. }
            | JobEvent::Progress { pipeline_id, .. }
            | JobEvent::Completed { pipeline_id, .. }
            | JobEvent::Failed { pipeline_id, .. } => pipeline_id,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Created { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. } => job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder().pipeline_id("echo").build()
    }

    #[test]
    fn created_event_carries_wire_tag() {
        let event = JobEvent::created(&sample_job());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"job:created""#));
        assert_eq!(event.event_type(), "job:created");
    }

    #[test]
    fn failed_event_serializes_structured_error() {
        let job = sample_job();
        let event = JobEvent::failed(&job, JobError::cancelled("stopped by caller"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"job:failed""#));
        assert!(json.contains(r#""cancelled":true"#));
    }

    #[test]
    fn events_roundtrip_serialize() {
        let mut job = sample_job();
        job.begin_attempt();
        job.finish_success(serde_json::json!({"echoed": 1}));

        let events = vec![
            JobEvent::created(&job),
            JobEvent::started(&job),
            JobEvent::progress(&job, serde_json::json!({"retry": {"attempt": 2}})),
            JobEvent::completed(&job),
            JobEvent::failed(&job, JobError::cancelled("x")),
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let back: JobEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back.event_type(), event.event_type());
            assert_eq!(back.job_id(), event.job_id());
        }
    }

    #[test]
    fn accessors_match_source_job() {
        let job = sample_job();
        let event = JobEvent::created(&job);
        assert_eq!(event.pipeline_id(), "echo");
        assert_eq!(event.job_id(), job.job_id);
    }
}
