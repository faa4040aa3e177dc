use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::metrics::{MetricValue, MetricsCollector};
use crate::storage::EndpointRepository;

const NAME: &str = "monitoring";

/// Endpoint, check and alert figures derived from the repository
///
/// Check statistics cover the last 24 hours.
pub struct MonitoringCollector {
    repository: Arc<dyn EndpointRepository>,
    enabled: AtomicBool,
    last_update: RwLock<Option<DateTime<Utc>>>,
}

impl MonitoringCollector {
    pub fn new(repository: Arc<dyn EndpointRepository>) -> Self {
        Self {
            repository,
            enabled: AtomicBool::new(true),
            last_update: RwLock::new(None),
        }
    }

    async fn gather(&self) -> anyhow::Result<Vec<MetricValue>> {
        let now = Utc::now();
        let tagged = |metric: MetricValue| metric.with_tag("collector", NAME).at(now);

        let counts = self
            .repository
            .endpoint_counts()
            .await
            .context("failed to count endpoints")?;
        let stats = self
            .repository
            .result_stats(now - chrono::Duration::hours(24))
            .await
            .context("failed to read check statistics")?;
        let alerts = self
            .repository
            .alert_count()
            .await
            .context("failed to count alerts")?;

        let mut metrics = vec![
            tagged(
                MetricValue::gauge("monitoring_endpoints_total", counts.total as f64)
                    .with_description("Total number of monitored endpoints"),
            ),
            tagged(
                MetricValue::gauge("monitoring_endpoints_active", counts.active as f64)
                    .with_description("Number of active endpoints"),
            ),
            tagged(
                MetricValue::counter("monitoring_checks_successful_24h", stats.successful as f64)
                    .with_tag("status", "success")
                    .with_description("Successful checks in the last 24 hours"),
            ),
            tagged(
                MetricValue::counter("monitoring_checks_failed_24h", stats.failed as f64)
                    .with_tag("status", "failed")
                    .with_description("Failed checks in the last 24 hours"),
            ),
        ];

        if let Some(avg) = stats.avg_response_time_ms {
            metrics.push(tagged(
                MetricValue::timer("monitoring_response_time_avg_ms_24h", avg)
                    .with_tag("unit", "ms")
                    .with_description("Average response time in the last 24 hours"),
            ));
        }
        if let Some(max) = stats.max_response_time_ms {
            metrics.push(tagged(
                MetricValue::timer("monitoring_response_time_max_ms_24h", max as f64)
                    .with_tag("unit", "ms")
                    .with_description("Maximum response time in the last 24 hours"),
            ));
        }

        metrics.push(tagged(
            MetricValue::gauge("monitoring_alerts_configured", alerts as f64)
                .with_description("Number of configured alert rules"),
        ));
        metrics.push(tagged(
            MetricValue::gauge(
                "monitoring_system_uptime_percent_24h",
                stats.uptime_percent(),
            )
            .with_tag("period", "24h")
            .with_description("Share of successful checks in the last 24 hours"),
        ));

        if let Ok(mut last) = self.last_update.write() {
            *last = Some(now);
        }

        Ok(metrics)
    }
}

#[async_trait]
impl MetricsCollector for MonitoringCollector {
    fn name(&self) -> &str {
        NAME
    }

    #[instrument(skip_all, fields(collector = NAME))]
    async fn collect(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<MetricValue>> {
        let metrics = tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!("monitoring collection cancelled"),
            metrics = self.gather() => metrics?,
        };

        debug!("collected {} monitoring metrics", metrics.len());
        Ok(metrics)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update.read().ok().and_then(|last| *last)
    }

    fn collection_interval(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }
}
