//! Storage contracts
//!
//! Three traits, each implemented by both the SQLite and the in-memory backend:
//!
//! - [`EndpointRepository`]: endpoints, alert rules and check results
//! - [`StreamSink`]: append-only named streams read by downstream analytics
//! - [`MetricsStore`]: persisted metric points and their aggregates

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::StorageResult;
use crate::metrics::MetricValue;
use crate::{Alert, Endpoint, MonitoringResult};

/// Check statistics over a time window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultStats {
    pub total: u64,

    /// Results with a 2xx status
    pub successful: u64,

    /// Results with a status >= 400 or without any status
    pub failed: u64,

    /// Mean of the non-zero response times
    pub avg_response_time_ms: Option<f64>,

    /// Largest non-zero response time
    pub max_response_time_ms: Option<u64>,
}

impl ResultStats {
    /// Fold a set of results into statistics
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a MonitoringResult>) -> Self {
        let mut stats = ResultStats::default();
        let mut timed = 0u64;
        let mut time_sum = 0u64;

        for result in results {
            stats.total += 1;
            match result.status_code {
                Some(code) if (200..300).contains(&code) => stats.successful += 1,
                Some(code) if code >= 400 => stats.failed += 1,
                Some(_) => {}
                None => stats.failed += 1,
            }

            if result.response_time > 0 {
                timed += 1;
                time_sum += result.response_time;
                stats.max_response_time_ms = stats
                    .max_response_time_ms
                    .max(Some(result.response_time));
            }
        }

        if timed > 0 {
            stats.avg_response_time_ms = Some(time_sum as f64 / timed as f64);
        }

        stats
    }

    /// Share of 2xx results in percent; 0 without results
    pub fn uptime_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total as f64 * 100.0
    }
}

/// Endpoint counts for dashboards and the monitoring collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointCounts {
    pub total: u64,
    pub active: u64,
}

/// Read/write contract of the monitoring core
///
/// The core only reads endpoints and alerts; `upsert_endpoint` and
/// `upsert_alert` exist for seeding and fixtures.
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    /// All active endpoints, in id order
    async fn get_active_endpoints(&self) -> StorageResult<Vec<Endpoint>>;

    /// Active alert rules of one endpoint
    async fn get_alerts_for_endpoint(&self, endpoint_id: i64) -> StorageResult<Vec<Alert>>;

    async fn save_result(&self, result: &MonitoringResult) -> StorageResult<()>;

    /// The `limit` most recent results of an endpoint, newest first
    async fn latest_results(
        &self,
        endpoint_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<MonitoringResult>>;

    /// Statistics over every result checked after `since`
    async fn result_stats(&self, since: DateTime<Utc>) -> StorageResult<ResultStats>;

    async fn endpoint_counts(&self) -> StorageResult<EndpointCounts>;

    /// Number of active alert rules
    async fn alert_count(&self) -> StorageResult<u64>;

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> StorageResult<()>;

    async fn upsert_alert(&self, alert: &Alert) -> StorageResult<()>;
}

/// One entry of a named stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEntry {
    /// Monotonic per backend, assigned on append
    pub id: u64,
    pub stream: String,
    pub fields: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only named streams
///
/// Appending the same fields twice creates two entries; consumers dedupe on
/// content, so retrying an append is safe.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Append one entry and return its id
    async fn append(&self, stream: &str, fields: BTreeMap<String, String>) -> StorageResult<u64>;

    /// Up to `limit` entries of `stream` with an id greater than `after_id`, oldest first
    async fn read_after(
        &self,
        stream: &str,
        after_id: u64,
        limit: usize,
    ) -> StorageResult<Vec<StreamEntry>>;
}

/// Aggregate statistics of one metric over a time range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricAggregate {
    pub name: String,
    pub count: u64,
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    /// Sample standard deviation, absent with fewer than two points
    pub stddev: Option<f64>,
}

impl MetricAggregate {
    pub fn from_values(name: &str, values: &[f64]) -> Self {
        let count = values.len();
        if count == 0 {
            return Self {
                name: name.to_string(),
                count: 0,
                average: None,
                minimum: None,
                maximum: None,
                stddev: None,
            };
        }

        let mean = values.iter().sum::<f64>() / count as f64;
        let minimum = values.iter().copied().fold(f64::INFINITY, f64::min);
        let maximum = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let stddev = (count > 1).then(|| {
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        });

        Self {
            name: name.to_string(),
            count: count as u64,
            average: Some(mean),
            minimum: Some(minimum),
            maximum: Some(maximum),
            stddev,
        }
    }
}

/// Persisted metric points
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn store(&self, metrics: &[MetricValue]) -> StorageResult<()>;

    /// Points with `start <= timestamp <= end`, newest first
    async fn retrieve(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricValue>>;

    /// Points of one metric with `start <= timestamp <= end`, newest first
    async fn retrieve_by_name(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricValue>>;

    async fn aggregate(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<MetricAggregate>;
}
