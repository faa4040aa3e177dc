//! Concurrency tests for the aggregator, the hub and overlapping cycles

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use api_monitor::{
    MonitoringResult,
    hub::HubHandle,
    metrics::{AggregatorError, MetricValue, MetricsAggregator, MetricsCollector},
    monitoring::{MonitoringOrchestrator, ResultBroadcaster},
    storage::{EndpointRepository, MemoryBackend},
};
use assert_matches::assert_matches;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

struct StubCollector {
    name: String,
    fail: bool,
    enabled: AtomicBool,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl StubCollector {
    fn new(name: &str, fail: bool, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_string(),
            fail,
            enabled: AtomicBool::new(true),
            running,
            peak,
        }
    }
}

#[async_trait]
impl MetricsCollector for StubCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, _cancel: &CancellationToken) -> anyhow::Result<Vec<MetricValue>> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            anyhow::bail!("{} source unavailable", self.name);
        }
        Ok(vec![MetricValue::gauge(format!("{}_value", self.name), 1.0)])
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_aggregator_returns_partial_results_within_worker_bound() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let aggregator = MetricsAggregator::new(3);

    let names = ["c01", "c02", "c03", "c04", "c05", "c06", "c07", "c08"];
    let failing = ["c03", "c06"];

    for name in names {
        aggregator
            .add_collector(Arc::new(StubCollector::new(
                name,
                failing.contains(&name),
                running.clone(),
                peak.clone(),
            )))
            .await
            .unwrap();
    }

    let outcome = aggregator.collect_all(&CancellationToken::new()).await;

    assert_eq!(outcome.metrics.len(), names.len() - failing.len());
    assert!(!outcome.metrics.contains_key("c03"));
    assert_matches!(
        outcome.error,
        Some(AggregatorError::CollectorFailed { ref name, .. }) if name == "c03"
    );
    assert!(peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_registry_rejects_bad_names_and_keeps_state() {
    let aggregator = MetricsAggregator::new(0);
    let counter = Arc::new(AtomicUsize::new(0));

    aggregator
        .add_collector(Arc::new(StubCollector::new(
            "system",
            false,
            counter.clone(),
            counter.clone(),
        )))
        .await
        .unwrap();

    assert_matches!(
        aggregator
            .add_collector(Arc::new(StubCollector::new(
                "system",
                false,
                counter.clone(),
                counter.clone(),
            )))
            .await,
        Err(AggregatorError::Duplicate(_))
    );
    assert_matches!(
        aggregator
            .add_collector(Arc::new(StubCollector::new(
                "",
                false,
                counter.clone(),
                counter.clone(),
            )))
            .await,
        Err(AggregatorError::EmptyName)
    );

    assert_eq!(aggregator.list_collectors().await, vec!["system".to_string()]);
    assert_eq!(aggregator.max_workers(), 5);
}

#[tokio::test]
async fn test_hub_fans_out_to_every_subscriber() {
    let hub = HubHandle::spawn();

    let mut subscriptions = Vec::new();
    for _ in 0..10 {
        subscriptions.push(hub.subscribe().await.unwrap());
    }
    assert_eq!(hub.subscriber_count().await.unwrap(), 10);

    hub.broadcast(MonitoringResult::success(3, 42, 200));

    for subscription in &mut subscriptions {
        let text = tokio::time::timeout(Duration::from_secs(1), subscription.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains("\"endpoint_id\":3"));
    }

    // dropped receivers are reaped on the next fan-out
    subscriptions.truncate(4);
    hub.broadcast(MonitoringResult::success(3, 40, 200));

    let mut remaining = 0;
    for _ in 0..50 {
        remaining = hub.subscriber_count().await.unwrap();
        if remaining == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remaining, 4);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_overlapping_cycles_each_record_their_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
        .mount(&server)
        .await;

    let backend = Arc::new(MemoryBackend::new());
    for id in 1..=5 {
        backend
            .upsert_endpoint(&create_test_endpoint(id, &server.uri()))
            .await
            .unwrap();
    }

    let orchestrator = Arc::new(MonitoringOrchestrator::new(
        backend.clone(),
        create_test_checker(),
        Arc::new(RecordingBroadcaster::default()),
        backend.clone(),
    ));

    let (first, second) = tokio::join!(orchestrator.run_cycle(), orchestrator.run_cycle());
    assert_eq!(first.unwrap().persisted, 5);
    assert_eq!(second.unwrap().persisted, 5);
    assert_eq!(backend.result_count().await, 10);
}
