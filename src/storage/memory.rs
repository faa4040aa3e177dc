//! In-memory storage backend (no persistence)
//!
//! Used by tests and when the storage backend is configured as `none`.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: results, stream entries and metric points are kept
//!   in bounded ring buffers; the oldest entries are evicted first

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{
    EndpointCounts, EndpointRepository, MetricAggregate, MetricsStore, ResultStats, StreamEntry,
    StreamSink,
};
use super::error::StorageResult;
use crate::metrics::MetricValue;
use crate::{Alert, Endpoint, MonitoringResult};

/// Maximum results to keep in memory per endpoint
const MAX_RESULTS_PER_ENDPOINT: usize = 1000;

/// Maximum entries to keep in memory per stream
const MAX_ENTRIES_PER_STREAM: usize = 10_000;

/// Maximum metric points to keep in memory
const MAX_METRICS: usize = 100_000;

#[derive(Default)]
struct MemoryState {
    endpoints: BTreeMap<i64, Endpoint>,
    alerts: BTreeMap<i64, Alert>,
    results: HashMap<i64, VecDeque<MonitoringResult>>,
    streams: HashMap<String, VecDeque<StreamEntry>>,
    /// Last assigned stream entry id, shared by all streams
    last_stream_id: u64,
    metrics: VecDeque<MetricValue>,
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored results across all endpoints
    pub async fn result_count(&self) -> usize {
        self.state.read().await.results.values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl EndpointRepository for MemoryBackend {
    async fn get_active_endpoints(&self) -> StorageResult<Vec<Endpoint>> {
        let state = self.state.read().await;
        Ok(state
            .endpoints
            .values()
            .filter(|e| e.is_active)
            .cloned()
            .collect())
    }

    async fn get_alerts_for_endpoint(&self, endpoint_id: i64) -> StorageResult<Vec<Alert>> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .values()
            .filter(|a| a.endpoint_id == endpoint_id && a.is_active)
            .cloned()
            .collect())
    }

    async fn save_result(&self, result: &MonitoringResult) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let buffer = state.results.entry(result.endpoint_id).or_default();
        if buffer.len() >= MAX_RESULTS_PER_ENDPOINT {
            buffer.pop_front();
        }
        buffer.push_back(result.clone());
        Ok(())
    }

    async fn latest_results(
        &self,
        endpoint_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<MonitoringResult>> {
        debug!("querying latest {limit} results for endpoint {endpoint_id}");

        let state = self.state.read().await;
        Ok(state
            .results
            .get(&endpoint_id)
            .map(|buffer| buffer.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn result_stats(&self, since: DateTime<Utc>) -> StorageResult<ResultStats> {
        let state = self.state.read().await;
        Ok(ResultStats::from_results(
            state
                .results
                .values()
                .flatten()
                .filter(|r| r.checked_at > since),
        ))
    }

    async fn endpoint_counts(&self) -> StorageResult<EndpointCounts> {
        let state = self.state.read().await;
        Ok(EndpointCounts {
            total: state.endpoints.len() as u64,
            active: state.endpoints.values().filter(|e| e.is_active).count() as u64,
        })
    }

    async fn alert_count(&self) -> StorageResult<u64> {
        let state = self.state.read().await;
        Ok(state.alerts.values().filter(|a| a.is_active).count() as u64)
    }

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> StorageResult<()> {
        let mut state = self.state.write().await;
        state.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn upsert_alert(&self, alert: &Alert) -> StorageResult<()> {
        let mut state = self.state.write().await;
        state.alerts.insert(alert.id, alert.clone());
        Ok(())
    }
}

#[async_trait]
impl StreamSink for MemoryBackend {
    async fn append(&self, stream: &str, fields: BTreeMap<String, String>) -> StorageResult<u64> {
        let mut state = self.state.write().await;
        state.last_stream_id += 1;
        let id = state.last_stream_id;

        let entries = state.streams.entry(stream.to_string()).or_default();
        if entries.len() >= MAX_ENTRIES_PER_STREAM {
            entries.pop_front();
        }
        entries.push_back(StreamEntry {
            id,
            stream: stream.to_string(),
            fields,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn read_after(
        &self,
        stream: &str,
        after_id: u64,
        limit: usize,
    ) -> StorageResult<Vec<StreamEntry>> {
        let state = self.state.read().await;
        Ok(state
            .streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.id > after_id)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl MetricsStore for MemoryBackend {
    async fn store(&self, metrics: &[MetricValue]) -> StorageResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        state.metrics.extend(metrics.iter().cloned());

        let overflow = state.metrics.len().saturating_sub(MAX_METRICS);
        if overflow > 0 {
            state.metrics.drain(..overflow);
            debug!("evicted {overflow} metric points");
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricValue>> {
        let state = self.state.read().await;
        let mut metrics: Vec<MetricValue> = state
            .metrics
            .iter()
            .filter(|m| m.timestamp >= start && m.timestamp <= end)
            .cloned()
            .collect();
        metrics.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(metrics)
    }

    async fn retrieve_by_name(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricValue>> {
        let mut metrics = self.retrieve(start, end).await?;
        metrics.retain(|m| m.name == name);
        Ok(metrics)
    }

    async fn aggregate(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<MetricAggregate> {
        let values: Vec<f64> = self
            .retrieve_by_name(name, start, end)
            .await?
            .iter()
            .map(|m| m.value)
            .collect();
        Ok(MetricAggregate::from_values(name, &values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn endpoint(id: i64, is_active: bool) -> Endpoint {
        Endpoint {
            id,
            user_id: 1,
            url: format!("https://service-{id}.example.com"),
            check_interval: 60,
            timeout: 1000,
            headers: None,
            is_active,
        }
    }

    #[tokio::test]
    async fn test_only_active_endpoints_are_returned() {
        let backend = MemoryBackend::new();
        backend.upsert_endpoint(&endpoint(2, true)).await.unwrap();
        backend.upsert_endpoint(&endpoint(1, true)).await.unwrap();
        backend.upsert_endpoint(&endpoint(3, false)).await.unwrap();

        let ids: Vec<i64> = backend
            .get_active_endpoints()
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(
            backend.endpoint_counts().await.unwrap(),
            EndpointCounts { total: 3, active: 2 }
        );
    }

    #[tokio::test]
    async fn test_latest_results_newest_first() {
        let backend = MemoryBackend::new();
        for ms in [10, 20, 30] {
            backend
                .save_result(&MonitoringResult::success(1, ms, 200))
                .await
                .unwrap();
        }

        let latest = backend.latest_results(1, 2).await.unwrap();
        let times: Vec<u64> = latest.iter().map(|r| r.response_time).collect();
        assert_eq!(times, vec![30, 20]);
        assert!(backend.latest_results(99, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_result_stats_respects_window() {
        let backend = MemoryBackend::new();
        let mut old = MonitoringResult::success(1, 500, 200);
        old.checked_at = Utc::now() - Duration::days(2);
        backend.save_result(&old).await.unwrap();
        backend
            .save_result(&MonitoringResult::failure(1, 0, "down"))
            .await
            .unwrap();

        let stats = backend
            .result_stats(Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_stream_append_and_read_after() {
        let backend = MemoryBackend::new();
        let fields = BTreeMap::from([("endpoint_id".to_string(), "1".to_string())]);

        let first = backend.append("api-metrics", fields.clone()).await.unwrap();
        backend.append("metrics:stream", fields.clone()).await.unwrap();
        let third = backend.append("api-metrics", fields).await.unwrap();

        let entries = backend.read_after("api-metrics", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first);

        let after = backend.read_after("api-metrics", first, 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, third);
    }

    #[tokio::test]
    async fn test_metrics_store_round_trip() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        backend
            .store(&[
                MetricValue::gauge("cpu", 10.0).at(now - Duration::minutes(2)),
                MetricValue::gauge("cpu", 30.0).at(now - Duration::minutes(1)),
                MetricValue::gauge("mem", 99.0).at(now),
            ])
            .await
            .unwrap();

        let all = backend
            .retrieve(now - Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].name, "mem");

        let agg = backend
            .aggregate("cpu", now - Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.average, Some(20.0));
    }

    #[tokio::test]
    async fn test_stream_is_capped_and_ids_stay_unique() {
        let backend = MemoryBackend::new();
        let fields = BTreeMap::from([("endpoint_id".to_string(), "1".to_string())]);

        let mut last = 0;
        for _ in 0..MAX_ENTRIES_PER_STREAM + 50 {
            last = backend.append("api-metrics", fields.clone()).await.unwrap();
        }
        let other = backend.append("metrics:stream", fields).await.unwrap();

        let entries = backend
            .read_after("api-metrics", 0, usize::MAX)
            .await
            .unwrap();
        assert_eq!(entries.len(), MAX_ENTRIES_PER_STREAM);
        assert_eq!(entries[0].id, 51);
        assert_eq!(entries.last().unwrap().id, last);
        assert_eq!(other, last + 1);
    }

    #[tokio::test]
    async fn test_metrics_are_capped_oldest_first() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let batch: Vec<MetricValue> = (0..MAX_METRICS + 10)
            .map(|i| MetricValue::counter("ticks", i as f64).at(now))
            .collect();

        backend.store(&batch).await.unwrap();

        let kept = backend
            .retrieve_by_name("ticks", now - Duration::minutes(1), now)
            .await
            .unwrap();
        assert_eq!(kept.len(), MAX_METRICS);
        assert!(kept.iter().all(|m| m.value >= 10.0));
    }
}
