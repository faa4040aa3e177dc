//! End-to-end monitoring cycles over the in-memory backend

use std::sync::Arc;
use std::time::Duration;

use api_monitor::{
    hub::HubHandle,
    monitoring::{MonitoringOrchestrator, RESULT_STREAM},
    storage::{EndpointRepository, MemoryBackend, StreamSink},
};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_cycle_records_success_timeout_and_invalid_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let backend = Arc::new(MemoryBackend::new());
    backend
        .upsert_endpoint(&create_test_endpoint(1, &format!("{}/ok", server.uri())))
        .await
        .unwrap();

    let mut slow = create_test_endpoint(2, &format!("{}/slow", server.uri()));
    slow.timeout = 10;
    backend.upsert_endpoint(&slow).await.unwrap();

    backend
        .upsert_endpoint(&create_test_endpoint(3, "not a url"))
        .await
        .unwrap();

    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let orchestrator = MonitoringOrchestrator::new(
        backend.clone(),
        create_test_checker(),
        broadcaster.clone(),
        backend.clone(),
    );

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.persisted, 3);
    assert_eq!(report.persist_failures, 0);

    assert_eq!(broadcaster.endpoint_ids(), vec![1, 2, 3]);
    assert_eq!(backend.result_count().await, 3);

    let ok = &backend.latest_results(1, 1).await.unwrap()[0];
    assert_eq!(ok.status_code, Some(200));
    assert!(ok.error_message.is_none());

    let timed_out = &backend.latest_results(2, 1).await.unwrap()[0];
    assert_eq!(timed_out.status_code, None);
    assert!(
        timed_out
            .error_message
            .as_deref()
            .unwrap()
            .contains("timeout")
    );

    let invalid = &backend.latest_results(3, 1).await.unwrap()[0];
    assert_eq!(invalid.status_code, None);
    assert_eq!(invalid.response_time, 0);
}

#[tokio::test]
async fn test_results_reach_the_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let backend = Arc::new(MemoryBackend::new());
    backend
        .upsert_endpoint(&create_test_endpoint(4, &server.uri()))
        .await
        .unwrap();

    let orchestrator = MonitoringOrchestrator::new(
        backend.clone(),
        create_test_checker(),
        Arc::new(RecordingBroadcaster::default()),
        backend.clone(),
    );
    orchestrator.run_cycle().await.unwrap();

    // the stream append runs detached
    let mut entries = Vec::new();
    for _ in 0..50 {
        entries = backend.read_after(RESULT_STREAM, 0, 10).await.unwrap();
        if !entries.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].fields["endpoint_id"], "4");
    assert_eq!(entries[0].fields["status_code"], "204");
    assert!(!entries[0].fields.contains_key("error_message"));
}

#[tokio::test]
async fn test_hub_subscribers_receive_cycle_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let backend = Arc::new(MemoryBackend::new());
    backend
        .upsert_endpoint(&create_test_endpoint(7, &server.uri()))
        .await
        .unwrap();

    let hub = HubHandle::spawn();
    let mut subscription = hub.subscribe().await.unwrap();

    let orchestrator = MonitoringOrchestrator::new(
        backend.clone(),
        create_test_checker(),
        Arc::new(hub.clone()),
        backend,
    );
    orchestrator.run_cycle().await.unwrap();

    let text = tokio::time::timeout(Duration::from_secs(1), subscription.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["endpoint_id"], 7);
    assert_eq!(json["status_code"], 200);

    hub.shutdown().await;
}
