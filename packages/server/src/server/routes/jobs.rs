//! Job endpoints: status lookup, cancel, retry.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::common::validation::is_valid_job_id;
use crate::kernel::jobs::{CancelOutcome, Job, JobExecutor};
use crate::server::app::AppState;
use crate::server::error::{envelope_ok, ApiError, ApiResult};

/// GET /api/jobs/{job_id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = fetch_job(&state, &job_id).await?;
    Ok(envelope_ok(job))
}

/// POST /api/jobs/{job_id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = fetch_job(&state, &job_id).await?;
    let executor = executor_for(&state, &job).await?;

    let outcome = executor.cancel(&job_id).await?;
    let status = match outcome {
        CancelOutcome::Cancelled => "ok",
        CancelOutcome::BestEffort => "ok_best_effort",
    };

    Ok(envelope_ok(json!({
        "job_id": job_id,
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// POST /api/jobs/{job_id}/retry — only valid when the source job failed.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let job = fetch_job(&state, &job_id).await?;
    let executor = executor_for(&state, &job).await?;

    let retried = executor.retry(&job_id).await?;

    Ok((
        StatusCode::CREATED,
        envelope_ok(json!({
            "job_id": retried.job_id,
            "pipeline_id": retried.pipeline_id,
            "source_job_id": job_id,
            "status": "queued",
            "timestamp": Utc::now().to_rfc3339(),
        })),
    ))
}

async fn fetch_job(state: &AppState, job_id: &str) -> ApiResult<Job> {
    if !is_valid_job_id(job_id) {
        return Err(ApiError::InvalidJobId(job_id.to_string()));
    }
    state
        .repository
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))
}

async fn executor_for(
    state: &AppState,
    job: &Job,
) -> ApiResult<std::sync::Arc<JobExecutor>> {
    Ok(state.registry.get(&job.pipeline_id).await?)
}
