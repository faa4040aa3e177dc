//! Pluggable metric collection
//!
//! ## Pipeline
//!
//! ```text
//! [SystemCollector, MonitoringCollector, ...] → MetricsAggregator::collect_all
//!                                                   │
//!                                    MetricsStore::store + MetricsPublisher::publish
//! ```

pub mod aggregator;
pub mod collectors;
pub mod publisher;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use aggregator::{AggregatorError, CollectOutcome, MetricsAggregator};
pub use publisher::{HandlerId, MetricsHandler, MetricsPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Gauge,
    Counter,
    Timer,
    Histogram,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::Gauge => write!(f, "gauge"),
            MetricType::Counter => write!(f, "counter"),
            MetricType::Timer => write!(f, "timer"),
            MetricType::Histogram => write!(f, "histogram"),
        }
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricType::Gauge),
            "counter" => Ok(MetricType::Counter),
            "timer" => Ok(MetricType::Timer),
            "histogram" => Ok(MetricType::Histogram),
            other => Err(format!("unknown metric type: {other}")),
        }
    }
}

/// A single metric data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
}

impl MetricValue {
    pub fn new(name: impl Into<String>, metric_type: MetricType, value: f64) -> Self {
        Self {
            name: name.into(),
            metric_type,
            value,
            timestamp: Utc::now(),
            tags: BTreeMap::new(),
            description: String::new(),
        }
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricType::Gauge, value)
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricType::Counter, value)
    }

    pub fn timer(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricType::Timer, value)
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A named source of metrics
///
/// Implementations are shared between the aggregator and its workers, so the
/// enabled flag uses interior mutability.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    fn name(&self) -> &str;

    /// Gather the current metrics; should return promptly once `cancel` fires
    async fn collect(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<MetricValue>>;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// When the collector last produced metrics
    fn last_update(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// How often the collector expects to be polled
    fn collection_interval(&self) -> Duration {
        Duration::from_secs(60)
    }
}
