//! HTTP surface of the monitor
//!
//! ## Endpoints
//!
//! - `GET /health` - Liveness, 200 or 503
//! - `POST /monitor` - Start a monitoring cycle in the background
//! - `GET /ws` - Live monitoring results as JSON text frames

pub mod routes;
pub mod state;
pub mod websocket;

pub use state::ApiState;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the router with all routes and layers
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/monitor", post(routes::monitor::trigger_cycle))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Spawn the API server
///
/// The server stops gracefully once the state's shutdown token fires; a serve
/// error marks the service unhealthy. Returns the bound address and the
/// server task.
pub async fn spawn_api_server(
    bind: SocketAddr,
    state: ApiState,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    info!("starting API server on {bind}");

    let health = state.health.clone();
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {addr}");

    let handle = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        if let Err(e) = served {
            error!("API server error: {e}");
            health.set_healthy(false);
        }
    });

    Ok((addr, handle))
}
