//! Pipeline endpoints: listing, triggering, and job listings.

use std::collections::HashMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::common::pagination::{self, has_more};
use crate::common::validation::is_valid_pipeline_id;
use crate::kernel::jobs::{GitContext, JobFilter, JobStatus};
use crate::server::app::AppState;
use crate::server::error::{envelope_ok, ApiError, ApiResult, FieldError};

/// GET /api/pipelines
pub async fn list_pipelines(State(state): State<AppState>) -> Json<serde_json::Value> {
    envelope_ok(json!({ "pipelines": state.registry.pipelines() }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerRequest {
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub git_context: Option<GitContext>,
}

/// POST /api/pipelines/{pipeline_id}/trigger
pub async fn trigger_pipeline(
    State(state): State<AppState>,
    Path(pipeline_id): Path<String>,
    body: Result<Json<TriggerRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    validate_pipeline_id(&pipeline_id)?;

    let request = match body {
        Ok(Json(request)) => request,
        // A body-less trigger is fine; malformed JSON is not.
        Err(JsonRejection::MissingJsonContentType(_)) => TriggerRequest::default(),
        Err(rejection) => {
            return Err(ApiError::field("body", rejection.to_string()));
        }
    };

    if let Some(parameters) = &request.parameters {
        if !parameters.is_object() {
            return Err(ApiError::field("parameters", "must be a JSON object"));
        }
    }

    let executor = state.registry.get(&pipeline_id).await?;
    let job = executor
        .create_job(
            request.parameters.unwrap_or_else(|| json!({})),
            request.git_context,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        envelope_ok(json!({
            "job_id": job.job_id,
            "pipeline_id": job.pipeline_id,
            "status": "queued",
            "timestamp": Utc::now().to_rfc3339(),
        })),
    ))
}

/// GET /api/pipelines/{pipeline_id}/jobs
///
/// Query keys are strict; pagination values are sanitized, never reflected.
pub async fn list_pipeline_jobs(
    State(state): State<AppState>,
    Path(pipeline_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_pipeline_id(&pipeline_id)?;
    if !state.registry.is_registered(&pipeline_id) {
        return Err(ApiError::UnknownPipeline {
            pipeline_id,
            known: state.registry.known_pipelines(),
        });
    }

    let mut errors = Vec::new();
    for key in query.keys() {
        if !matches!(key.as_str(), "status" | "limit" | "offset" | "tab") {
            errors.push(FieldError::new(key.clone(), "unknown query parameter"));
        }
    }

    let status = match query.get("status").map(String::as_str) {
        None => None,
        Some("queued") => Some(JobStatus::Queued),
        Some("running") => Some(JobStatus::Running),
        Some("completed") => Some(JobStatus::Completed),
        Some("failed") => Some(JobStatus::Failed),
        Some(other) => {
            errors.push(FieldError::new(
                "status",
                format!("unknown status `{other}`"),
            ));
            None
        }
    };

    let tab = match query.get("tab").map(String::as_str) {
        None | Some("recent") => Tab::Recent,
        Some("failed") => Tab::Failed,
        Some("all") => Tab::All,
        Some(other) => {
            errors.push(FieldError::new("tab", format!("unknown tab `{other}`")));
            Tab::Recent
        }
    };

    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let max_limit = i64::from(state.config.pagination_max_limit).min(100);
    let page = pagination::sanitize(
        query.get("limit").map(String::as_str),
        query.get("offset").map(String::as_str),
        10,
        max_limit,
    );

    let filter = JobFilter {
        pipeline_id: Some(pipeline_id.clone()),
        status: match tab {
            Tab::Failed => Some(JobStatus::Failed),
            Tab::Recent | Tab::All => status,
        },
        limit: page.limit,
        offset: page.offset,
    };

    let (jobs, total) = state.repository.list(&filter).await?;
    let returned = jobs.len();

    Ok(envelope_ok(json!({
        "pipeline_id": pipeline_id,
        "jobs": jobs,
        "total": total,
        "has_more": has_more(total, page.offset, returned),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

enum Tab {
    Recent,
    Failed,
    All,
}

fn validate_pipeline_id(pipeline_id: &str) -> ApiResult<()> {
    if is_valid_pipeline_id(pipeline_id) {
        Ok(())
    } else {
        Err(ApiError::field(
            "pipeline_id",
            "must match [A-Za-z0-9_-]{1,64}",
        ))
    }
}
