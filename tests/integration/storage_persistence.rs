//! Integration tests for SQLite persistence
//!
//! These tests verify that:
//! - Results written by a monitoring cycle survive a reopen
//! - Stream entries and metrics share the same database file
//! - The configured storage opens the SQLite backend

use std::sync::Arc;

use api_monitor::{
    config::StorageConfig,
    metrics::{MetricValue, MetricsPublisher, publisher::METRICS_STREAM},
    monitoring::MonitoringOrchestrator,
    storage::{EndpointRepository, MetricsStore, Storage, StreamSink, sqlite::SqliteBackend},
};
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_cycle_results_survive_reopen() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("monitor.db");

    {
        let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
        backend
            .upsert_endpoint(&create_test_endpoint(1, &server.uri()))
            .await
            .unwrap();

        let orchestrator = MonitoringOrchestrator::new(
            backend.clone(),
            create_test_checker(),
            Arc::new(RecordingBroadcaster::default()),
            backend.clone(),
        );
        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.persisted, 1);

        backend.close().await;
    }

    let reopened = SqliteBackend::new(&db_path).await.unwrap();
    let results = reopened.latest_results(1, 10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status_code, Some(200));

    let stats = reopened
        .result_stats(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.successful, 1);
}

#[tokio::test]
async fn test_metrics_pipeline_on_sqlite() {
    let temp_dir = tempdir().unwrap();
    let config = StorageConfig::Sqlite {
        path: temp_dir.path().join("metrics.db"),
    };
    let storage = Storage::open(&config).await.unwrap();

    let now = Utc::now();
    let metrics = vec![
        MetricValue::gauge("system_cpu_usage_percent", 10.0).at(now - Duration::minutes(2)),
        MetricValue::gauge("system_cpu_usage_percent", 30.0).at(now - Duration::minutes(1)),
        MetricValue::gauge("system_memory_usage_percent", 55.0).at(now),
    ];

    storage.metrics.store(&metrics).await.unwrap();
    MetricsPublisher::new(storage.streams.clone())
        .publish(&CancellationToken::new(), &metrics)
        .await
        .unwrap();

    let window_start = now - Duration::minutes(5);
    let window_end = now + Duration::minutes(1);

    let cpu = storage
        .metrics
        .retrieve_by_name("system_cpu_usage_percent", window_start, window_end)
        .await
        .unwrap();
    assert_eq!(cpu.len(), 2);

    let aggregate = storage
        .metrics
        .aggregate("system_cpu_usage_percent", window_start, window_end)
        .await
        .unwrap();
    assert_eq!(aggregate.count, 2);
    assert_eq!(aggregate.average, Some(20.0));
    assert_eq!(aggregate.minimum, Some(10.0));
    assert_eq!(aggregate.maximum, Some(30.0));

    let entries = storage
        .streams
        .read_after(METRICS_STREAM, 0, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].fields["name"], "system_cpu_usage_percent");
}
