//! Manual cycle trigger

use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::api::state::ApiState;

/// POST /monitor
///
/// Starts a monitoring cycle in the background and answers right away
pub async fn trigger_cycle(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let orchestrator = state.orchestrator.clone();

    tokio::spawn(async move {
        match orchestrator.run_cycle().await {
            Ok(report) => info!(
                "manual cycle finished: {} checked, {} persisted",
                report.checked, report.persisted
            ),
            Err(e) => error!("manual cycle failed: {e}"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "monitoring cycle started" })),
    )
}
