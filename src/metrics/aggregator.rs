//! MetricsAggregator - runs registered collectors concurrently
//!
//! The registry is keyed by collector name and ordered, so "first error"
//! always means the alphabetically first failing collector of a run.
//! Collection never holds the registry lock: the enabled collectors are
//! snapshotted first, then run on a worker pool bounded by a semaphore.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{MetricValue, MetricsCollector};

pub const DEFAULT_MAX_WORKERS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("collector name cannot be empty")]
    EmptyName,

    #[error("collector '{0}' already registered")]
    Duplicate(String),

    #[error("collector '{0}' not found")]
    NotFound(String),

    #[error("collector '{name}' failed: {source}")]
    CollectorFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("collection cancelled")]
    Cancelled,
}

/// Result of [`MetricsAggregator::collect_all`]
///
/// Successful collectors are present in `metrics` even when others failed.
#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub metrics: BTreeMap<String, Vec<MetricValue>>,
    pub error: Option<AggregatorError>,
}

impl CollectOutcome {
    /// All metrics, in collector name order
    pub fn flatten(&self) -> Vec<MetricValue> {
        self.metrics.values().flatten().cloned().collect()
    }

    pub fn total_metrics(&self) -> usize {
        self.metrics.values().map(Vec::len).sum()
    }
}

pub struct MetricsAggregator {
    collectors: RwLock<BTreeMap<String, Arc<dyn MetricsCollector>>>,
    max_workers: usize,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl MetricsAggregator {
    /// Create an aggregator running at most `max_workers` collectors at once
    pub fn new(max_workers: usize) -> Self {
        let max_workers = if max_workers == 0 {
            DEFAULT_MAX_WORKERS
        } else {
            max_workers
        };

        Self {
            collectors: RwLock::new(BTreeMap::new()),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub async fn add_collector(
        &self,
        collector: Arc<dyn MetricsCollector>,
    ) -> Result<(), AggregatorError> {
        let name = collector.name().to_string();
        if name.is_empty() {
            return Err(AggregatorError::EmptyName);
        }

        let mut collectors = self.collectors.write().await;
        if collectors.contains_key(&name) {
            return Err(AggregatorError::Duplicate(name));
        }

        info!("registered metrics collector '{name}'");
        collectors.insert(name, collector);
        Ok(())
    }

    pub async fn remove_collector(&self, name: &str) -> Result<(), AggregatorError> {
        let mut collectors = self.collectors.write().await;
        match collectors.remove(name) {
            Some(_) => {
                info!("removed metrics collector '{name}'");
                Ok(())
            }
            None => Err(AggregatorError::NotFound(name.to_string())),
        }
    }

    /// Registered collector names, sorted
    pub async fn list_collectors(&self) -> Vec<String> {
        self.collectors.read().await.keys().cloned().collect()
    }

    /// Run every enabled collector and gather partial results plus the first error
    #[instrument(skip_all)]
    pub async fn collect_all(&self, cancel: &CancellationToken) -> CollectOutcome {
        let enabled: Vec<(String, Arc<dyn MetricsCollector>)> = {
            let collectors = self.collectors.read().await;
            collectors
                .iter()
                .filter(|(_, c)| c.is_enabled())
                .map(|(name, c)| (name.clone(), c.clone()))
                .collect()
        };

        debug!(
            "collecting from {} collectors with {} workers",
            enabled.len(),
            self.max_workers
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut handles = Vec::with_capacity(enabled.len());

        for (name, collector) in enabled {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let task_name = name.clone();

            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AggregatorError::Cancelled),
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| AggregatorError::Cancelled)?
                    }
                };

                if cancel.is_cancelled() {
                    return Err(AggregatorError::Cancelled);
                }

                collector
                    .collect(&cancel)
                    .await
                    .map_err(|source| AggregatorError::CollectorFailed {
                        name: task_name,
                        source,
                    })
            });

            handles.push((name, handle));
        }

        let mut outcome = CollectOutcome::default();

        // name order, so the first recorded error is deterministic
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!("collector '{name}' task failed: {join_error}");
                    Err(AggregatorError::CollectorFailed {
                        name: name.clone(),
                        source: anyhow::anyhow!("collector task failed: {join_error}"),
                    })
                }
            };

            match result {
                Ok(metrics) => {
                    debug!("collector '{name}' returned {} metrics", metrics.len());
                    outcome.metrics.insert(name, metrics);
                }
                Err(e) => {
                    warn!("{e}");
                    if outcome.error.is_none() {
                        outcome.error = Some(e);
                    }
                }
            }
        }

        outcome
    }

    /// Run a single collector; a disabled collector yields no metrics
    #[instrument(skip(self, cancel))]
    pub async fn collect_from(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Vec<MetricValue>, AggregatorError> {
        let collector = self
            .collectors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AggregatorError::NotFound(name.to_string()))?;

        if !collector.is_enabled() {
            debug!("collector '{name}' is disabled");
            return Ok(Vec::new());
        }

        collector
            .collect(cancel)
            .await
            .map_err(|source| AggregatorError::CollectorFailed {
                name: name.to_string(),
                source,
            })
    }

    /// Toggle a registered collector
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), AggregatorError> {
        let collectors = self.collectors.read().await;
        let collector = collectors
            .get(name)
            .ok_or_else(|| AggregatorError::NotFound(name.to_string()))?;
        collector.set_enabled(enabled);
        Ok(())
    }
}
