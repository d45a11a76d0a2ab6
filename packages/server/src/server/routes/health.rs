//! Liveness and aggregated health endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::kernel::secrets::CircuitState;
use crate::server::app::AppState;
use crate::server::error::envelope_ok;

/// GET /health — liveness.
pub async fn health_handler() -> Json<serde_json::Value> {
    envelope_ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// GET /api/health/secrets — secret-provider health view.
///
/// 200 while the circuit is closed, 503 otherwise.
pub async fn secrets_health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let health = state.secrets.health().await;
    let status = if health.state == CircuitState::Closed {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, envelope_ok(health))
}

/// GET /api/status — executor stats plus repository and secret health.
pub async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let pipelines = state.registry.stats();
    let repository = state.repository.get_health();
    let secrets = state.secrets.health().await;

    envelope_ok(json!({
        "pipelines": pipelines,
        "repository": repository,
        "secrets": secrets,
    }))
}
