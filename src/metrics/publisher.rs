//! MetricsPublisher - appends metrics to a stream and fans them out to handlers
//!
//! Handlers run detached after the stream append succeeded; a failing
//! handler is logged and does not affect the publisher or other handlers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::MetricValue;
use crate::storage::StreamSink;

/// Stream receiving every published metric
pub const METRICS_STREAM: &str = "metrics:stream";

pub type HandlerId = u64;

/// Receives every published batch
#[async_trait]
pub trait MetricsHandler: Send + Sync {
    async fn handle(&self, metrics: &[MetricValue]) -> anyhow::Result<()>;
}

/// Stream fields of one metric; tags are flattened into `tag_<key>`
pub fn metric_stream_fields(metric: &MetricValue) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::from([
        ("name".to_string(), metric.name.clone()),
        ("type".to_string(), metric.metric_type.to_string()),
        ("value".to_string(), metric.value.to_string()),
        ("timestamp".to_string(), metric.timestamp.timestamp().to_string()),
        ("description".to_string(), metric.description.clone()),
    ]);

    for (key, value) in &metric.tags {
        fields.insert(format!("tag_{key}"), value.clone());
    }

    fields
}

pub struct MetricsPublisher {
    streams: Arc<dyn StreamSink>,
    handlers: RwLock<BTreeMap<HandlerId, Arc<dyn MetricsHandler>>>,
    next_id: AtomicU64,
}

impl MetricsPublisher {
    pub fn new(streams: Arc<dyn StreamSink>) -> Self {
        Self {
            streams,
            handlers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append each metric to the stream, then notify handlers
    ///
    /// Stops at the first failed append; handlers only see fully published batches.
    #[instrument(skip_all, fields(count = metrics.len()))]
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        metrics: &[MetricValue],
    ) -> anyhow::Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        for metric in metrics {
            if cancel.is_cancelled() {
                anyhow::bail!("publishing cancelled");
            }

            self.streams
                .append(METRICS_STREAM, metric_stream_fields(metric))
                .await
                .with_context(|| format!("failed to publish metric {}", metric.name))?;
        }

        let batch: Arc<Vec<MetricValue>> = Arc::new(metrics.to_vec());
        let handlers = self.handlers.read().await;

        for (id, handler) in handlers.iter() {
            let handler = handler.clone();
            let batch = batch.clone();
            let id = *id;

            tokio::spawn(async move {
                if let Err(e) = handler.handle(&batch).await {
                    warn!("metrics handler {id} failed: {e:#}");
                }
            });
        }

        debug!("published {} metrics to {} handlers", metrics.len(), handlers.len());
        Ok(())
    }

    pub async fn subscribe(&self, handler: Arc<dyn MetricsHandler>) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().await.insert(id, handler);
        id
    }

    /// Returns whether the handler was registered
    pub async fn unsubscribe(&self, id: HandlerId) -> bool {
        self.handlers.write().await.remove(&id).is_some()
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}
