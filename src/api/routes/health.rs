//! Health check endpoint

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::api::state::ApiState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// GET /health
///
/// 200 while the service is healthy, 503 once it is shutting down or failed
pub async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    if state.health.is_healthy() {
        (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
            }),
        )
    }
}
