//! Application setup and router wiring.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kernel::event_hub::EventHub;
use crate::kernel::jobs::{JobRepository, WorkerRegistry};
use crate::kernel::secrets::SecretProvider;
use crate::server::routes::{
    cancel_job, get_job, health_handler, list_pipeline_jobs, list_pipelines, pipeline_events,
    retry_job, secrets_health_handler, status_handler, trigger_pipeline,
};

/// Shared application state.
///
/// The registry, repository, hub, and secret provider are the only shared
/// mutable state; each defines its own concurrency contract. Handlers run
/// in parallel against these handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<WorkerRegistry>,
    pub repository: Arc<JobRepository>,
    pub events: EventHub,
    pub secrets: Arc<SecretProvider>,
}

/// Build the Axum application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/health/secrets", get(secrets_health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/pipelines", get(list_pipelines))
        .route("/api/pipelines/:pipeline_id/trigger", post(trigger_pipeline))
        .route("/api/pipelines/:pipeline_id/jobs", get(list_pipeline_jobs))
        .route("/api/pipelines/:pipeline_id/events", get(pipeline_events))
        .route("/api/jobs/:job_id", get(get_job))
        .route("/api/jobs/:job_id/cancel", post(cancel_job))
        .route("/api/jobs/:job_id/retry", post(retry_job))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
