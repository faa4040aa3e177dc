//! Failure handling of the monitoring pipeline
//!
//! - Unreachable endpoints and an opening circuit breaker
//! - Persistence failures
//! - An alert service that is slow to answer

use std::sync::Arc;
use std::time::Duration;

use api_monitor::{
    Alert, Endpoint, MonitoringResult,
    monitoring::{EndpointChecker, HttpAlertNotifier, MonitoringOrchestrator},
    resilience::CircuitBreakerConfig,
    storage::{
        EndpointCounts, EndpointRepository, MemoryBackend, ResultStats, StorageError,
        StorageResult,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use reqwest::Client;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

/// Serves endpoints from memory but refuses to store results
struct ReadOnlyRepository {
    inner: MemoryBackend,
}

#[async_trait]
impl EndpointRepository for ReadOnlyRepository {
    async fn get_active_endpoints(&self) -> StorageResult<Vec<Endpoint>> {
        self.inner.get_active_endpoints().await
    }
    async fn get_alerts_for_endpoint(&self, endpoint_id: i64) -> StorageResult<Vec<Alert>> {
        self.inner.get_alerts_for_endpoint(endpoint_id).await
    }
    async fn save_result(&self, _: &MonitoringResult) -> StorageResult<()> {
        Err(StorageError::QueryFailed("attempt to write a readonly database".to_string()))
    }
    async fn latest_results(&self, id: i64, limit: usize) -> StorageResult<Vec<MonitoringResult>> {
        self.inner.latest_results(id, limit).await
    }
    async fn result_stats(&self, since: DateTime<Utc>) -> StorageResult<ResultStats> {
        self.inner.result_stats(since).await
    }
    async fn endpoint_counts(&self) -> StorageResult<EndpointCounts> {
        self.inner.endpoint_counts().await
    }
    async fn alert_count(&self) -> StorageResult<u64> {
        self.inner.alert_count().await
    }
    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> StorageResult<()> {
        self.inner.upsert_endpoint(endpoint).await
    }
    async fn upsert_alert(&self, alert: &Alert) -> StorageResult<()> {
        self.inner.upsert_alert(alert).await
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_opens_its_breaker() {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .upsert_endpoint(&create_test_endpoint(1, "http://127.0.0.1:1/health"))
        .await
        .unwrap();

    let checker = Arc::new(EndpointChecker::new(
        Client::new(),
        fast_retry_config(),
        CircuitBreakerConfig {
            name: "endpoint".to_string(),
            max_failures: 2,
            reset_interval: Duration::from_secs(60),
        },
    ));
    let orchestrator = MonitoringOrchestrator::new(
        backend.clone(),
        checker,
        Arc::new(RecordingBroadcaster::default()),
        backend.clone(),
    );

    for _ in 0..3 {
        orchestrator.run_cycle().await.unwrap();
    }

    let results = backend.latest_results(1, 10).await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status_code.is_none()));

    let open: Vec<_> = results
        .iter()
        .filter(|r| {
            r.error_message
                .as_deref()
                .is_some_and(|m| m.contains("circuit breaker 'endpoint-1' is open"))
        })
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].response_time, 0);
}

#[tokio::test]
async fn test_persistence_failures_are_counted_and_not_broadcast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let repository = Arc::new(ReadOnlyRepository {
        inner: MemoryBackend::new(),
    });
    repository
        .upsert_endpoint(&create_test_endpoint(1, &server.uri()))
        .await
        .unwrap();
    repository
        .upsert_endpoint(&create_test_endpoint(2, &server.uri()))
        .await
        .unwrap();

    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let orchestrator = MonitoringOrchestrator::new(
        repository,
        create_test_checker(),
        broadcaster.clone(),
        Arc::new(MemoryBackend::new()),
    );

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.persisted, 0);
    assert_eq!(report.persist_failures, 2);
    assert!(broadcaster.endpoint_ids().is_empty());
}

#[tokio::test]
async fn test_slow_alert_service_does_not_block_the_cycle() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&target)
        .await;

    let alerts = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/monitoring/evaluate-alerts"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&alerts)
        .await;

    let backend = Arc::new(MemoryBackend::new());
    backend
        .upsert_endpoint(&create_test_endpoint(5, &target.uri()))
        .await
        .unwrap();

    let orchestrator = MonitoringOrchestrator::new(
        backend.clone(),
        create_test_checker(),
        Arc::new(RecordingBroadcaster::default()),
        backend.clone(),
    )
    .with_notifier(Arc::new(HttpAlertNotifier::new(Client::new(), &alerts.uri())));

    let started = std::time::Instant::now();
    let report = orchestrator.run_cycle().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(report.persisted, 1);

    let stored = &backend.latest_results(5, 1).await.unwrap()[0];
    assert_eq!(stored.status_code, Some(500));

    let mut received = 0;
    for _ in 0..100 {
        received = alerts.received_requests().await.map_or(0, |r| r.len());
        if received > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received, 1);
}
