//! Integration tests for the HTTP surface
//!
//! These tests run the real server on a random port and verify:
//! - Health status follows the shared flag
//! - `POST /monitor` runs a cycle in the background
//! - WebSocket clients receive monitoring results and unsubscribe on close

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use api_monitor::{
    MonitoringResult,
    api::{ApiState, spawn_api_server},
    health::HealthState,
    hub::HubHandle,
    monitoring::{MonitoringOrchestrator, ResultBroadcaster},
    storage::{EndpointRepository, MemoryBackend},
};
use axum::http::StatusCode;
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

struct TestApi {
    addr: SocketAddr,
    health: HealthState,
    hub: HubHandle,
    backend: Arc<MemoryBackend>,
    shutdown: CancellationToken,
}

async fn spawn_test_api() -> TestApi {
    let backend = Arc::new(MemoryBackend::new());
    let hub = HubHandle::spawn();
    let health = HealthState::new();
    let shutdown = CancellationToken::new();

    let orchestrator = Arc::new(
        MonitoringOrchestrator::new(
            backend.clone(),
            create_test_checker(),
            Arc::new(hub.clone()),
            backend.clone(),
        )
        .with_shutdown(shutdown.clone()),
    );

    let state = ApiState::new(health.clone(), hub.clone(), orchestrator, shutdown.clone());
    let (addr, _server) = spawn_api_server("127.0.0.1:0".parse().unwrap(), state)
        .await
        .unwrap();

    TestApi {
        addr,
        health,
        hub,
        backend,
        shutdown,
    }
}

#[tokio::test]
async fn test_health_endpoint_follows_flag() {
    let api = spawn_test_api().await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/health", api.addr);

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status().as_u16(), StatusCode::OK.as_u16());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");

    api.health.set_healthy(false);
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(
        response.status().as_u16(),
        StatusCode::SERVICE_UNAVAILABLE.as_u16()
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "unhealthy");

    api.shutdown.cancel();
}

#[tokio::test]
async fn test_monitor_trigger_runs_a_cycle() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    let api = spawn_test_api().await;
    api.backend
        .upsert_endpoint(&create_test_endpoint(1, &target.uri()))
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .post(format!("http://{}/monitor", api.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), StatusCode::ACCEPTED.as_u16());

    let mut stored = 0;
    for _ in 0..100 {
        stored = api.backend.result_count().await;
        if stored > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored, 1);

    api.shutdown.cancel();
}

#[tokio::test]
async fn test_websocket_streams_results() {
    let api = spawn_test_api().await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", api.addr))
        .await
        .unwrap();

    // the handler subscribes after the upgrade completed
    for _ in 0..100 {
        if api.hub.subscriber_count().await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(api.hub.subscriber_count().await.unwrap(), 1);

    api.hub.broadcast(MonitoringResult::failure(9, 12, "request failed: boom"));

    let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = match message {
        Message::Text(text) => text,
        other => panic!("expected a text frame, got {other:?}"),
    };
    let json: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["endpoint_id"], 9);
    assert_eq!(json["error_message"], "request failed: boom");

    socket.send(Message::Close(None)).await.unwrap();

    let mut remaining = 1;
    for _ in 0..100 {
        remaining = api.hub.subscriber_count().await.unwrap();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remaining, 0);

    api.shutdown.cancel();
}
