//! Stable API envelope and error taxonomy.
//!
//! Every response shares the `{success, data | error, timestamp}` envelope;
//! error codes are machine-readable string constants and messages stay
//! short and human-readable. Typed kernel errors convert into [`ApiError`]
//! here so no internal error type crosses the HTTP boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::kernel::jobs::{ExecutorError, RegistryError, RepositoryError};
use crate::kernel::secrets::SecretError;

/// One field-level validation failure, surfaced in `error.details.errors`.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: "INVALID_REQUEST".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request validation failed")]
    Validation(Vec<FieldError>),

    #[error("invalid job id")]
    InvalidJobId(String),

    #[error("unknown pipeline: {pipeline_id}")]
    UnknownPipeline {
        pipeline_id: String,
        known: Vec<String>,
    },

    #[error("job {0} is already in a terminal state")]
    AlreadyTerminal(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    UpstreamUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(errors: Vec<FieldError>) -> Self {
        ApiError::Validation(errors)
    }

    pub fn field(field: &str, message: impl Into<String>) -> Self {
        ApiError::Validation(vec![FieldError::new(field, message)])
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "INVALID_REQUEST",
            ApiError::InvalidJobId(_) => "INVALID_JOB_ID",
            ApiError::UnknownPipeline { .. } => "UNKNOWN_PIPELINE",
            ApiError::AlreadyTerminal(_) => "ALREADY_TERMINAL",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidJobId(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownPipeline { .. } | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyTerminal(_) => StatusCode::CONFLICT,
            ApiError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Validation(errors) => Some(json!({ "errors": errors })),
            ApiError::UnknownPipeline { known, .. } => {
                Some(json!({ "known_pipelines": known }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }

        let body = json!({
            "success": false,
            "error": error,
            "timestamp": Utc::now().to_rfc3339(),
        });

        (self.status_code(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Success envelope.
pub fn envelope_ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::UnknownPipeline { pipeline_id, known } => {
                ApiError::UnknownPipeline { pipeline_id, known }
            }
            RegistryError::InitFailed { .. } => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(error: ExecutorError) -> Self {
        match error {
            ExecutorError::NotFound { job_id } => ApiError::NotFound(format!("job {job_id}")),
            ExecutorError::AlreadyTerminal { job_id, .. } => ApiError::AlreadyTerminal(job_id),
            ExecutorError::NotRetryable { .. } => {
                ApiError::field("status", "only failed jobs can be retried")
            }
            ExecutorError::InvalidInput(message) => ApiError::field("parameters", message),
            ExecutorError::ShuttingDown { .. } | ExecutorError::Persist(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::InvalidJobId { id } => ApiError::InvalidJobId(id),
            RepositoryError::Persist(message) => ApiError::Internal(message),
        }
    }
}

impl From<SecretError> for ApiError {
    fn from(error: SecretError) -> Self {
        match error {
            SecretError::Unavailable => {
                ApiError::UpstreamUnavailable("secret source unavailable".to_string())
            }
            SecretError::Missing { key } => ApiError::NotFound(format!("secret {key}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_are_stable() {
        let cases: Vec<(ApiError, &str, StatusCode)> = vec![
            (
                ApiError::field("x", "bad"),
                "INVALID_REQUEST",
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::InvalidJobId("weird id".to_string()),
                "INVALID_JOB_ID",
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::UnknownPipeline {
                    pipeline_id: "x".to_string(),
                    known: vec![],
                },
                "UNKNOWN_PIPELINE",
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::AlreadyTerminal("j".to_string()),
                "ALREADY_TERMINAL",
                StatusCode::CONFLICT,
            ),
            (
                ApiError::NotFound("job j".to_string()),
                "NOT_FOUND",
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::UpstreamUnavailable("down".to_string()),
                "UPSTREAM_UNAVAILABLE",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::Internal("boom".to_string()),
                "INTERNAL",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, code, status) in cases {
            assert_eq!(error.code(), code);
            assert_eq!(error.status_code(), status);
        }
    }

    #[test]
    fn validation_details_list_field_errors() {
        let error = ApiError::validation(vec![
            FieldError::new("limit", "must be numeric"),
            FieldError::new("tab", "unknown value"),
        ]);
        let details = error.details().unwrap();
        assert_eq!(details["errors"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn executor_errors_map_to_api_codes() {
        let error: ApiError = ExecutorError::NotFound {
            job_id: "j1".to_string(),
        }
        .into();
        assert_eq!(error.code(), "NOT_FOUND");

        let error: ApiError = ExecutorError::AlreadyTerminal {
            job_id: "j1".to_string(),
            status: crate::kernel::jobs::JobStatus::Completed,
        }
        .into();
        assert_eq!(error.code(), "ALREADY_TERMINAL");
    }
}
