//! Health Check Endpoints
//!
//! Liveness and readiness probe handlers for Kubernetes.

use super::state::{AppState, Readiness};
use axum::{extract::State, http::StatusCode, response::Json};

/// Liveness probe. Answering at all means the serve loop is alive.
#[tracing::instrument(skip_all)]
pub async fn health_check() -> &'static str {
    "OK"
}

/// Readiness probe. 503 until the node is running, registered and has a
/// peer listing, and again once shutdown begins.
#[tracing::instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let readiness = state.readiness();
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}
