//! MonitoringOrchestrator - runs monitoring cycles over all active endpoints
//!
//! ## Cycle
//!
//! 1. fetch the active endpoints (one snapshot per cycle)
//! 2. spawn one check task per endpoint, each sending its result on an mpsc channel
//! 3. drain the channel: persist, then broadcast and hand off to the detached
//!    stream publisher and alert notifier
//!
//! The channel closes once every check task has dropped its sender. Per-endpoint
//! failures never fail the cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::checker::EndpointChecker;
use super::error::MonitorError;
use super::{AlertNotifier, ResultBroadcaster};
use crate::MonitoringResult;
use crate::config::MonitorConfig;
use crate::resilience::{Retrier, RetryConfig};
use crate::storage::{EndpointRepository, StreamSink};

/// Stream receiving every persisted monitoring result
pub const RESULT_STREAM: &str = "api-metrics";

const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Summary of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Results received from check tasks
    pub checked: usize,
    pub persisted: usize,
    pub persist_failures: usize,
}

/// Stream fields of a result; status and error only when present
pub fn result_stream_fields(result: &MonitoringResult) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::from([
        ("endpoint_id".to_string(), result.endpoint_id.to_string()),
        ("response_time".to_string(), result.response_time.to_string()),
        ("timestamp".to_string(), result.checked_at.to_rfc3339()),
    ]);

    if let Some(status) = result.status_code {
        fields.insert("status_code".to_string(), status.to_string());
    }
    if let Some(message) = &result.error_message {
        fields.insert("error_message".to_string(), message.clone());
    }

    fields
}

pub struct MonitoringOrchestrator {
    repository: Arc<dyn EndpointRepository>,
    checker: Arc<EndpointChecker>,
    broadcaster: Arc<dyn ResultBroadcaster>,
    streams: Arc<dyn StreamSink>,
    notifier: Option<Arc<dyn AlertNotifier>>,

    /// Retry policy of the detached publish and notify tasks
    retrier: Retrier,
    cycle_timeout: Duration,
    notify_timeout: Duration,

    /// Service-wide shutdown; cycles and detached tasks stop when it fires
    shutdown: CancellationToken,
}

impl MonitoringOrchestrator {
    pub fn new(
        repository: Arc<dyn EndpointRepository>,
        checker: Arc<EndpointChecker>,
        broadcaster: Arc<dyn ResultBroadcaster>,
        streams: Arc<dyn StreamSink>,
    ) -> Self {
        Self {
            repository,
            checker,
            broadcaster,
            streams,
            notifier: None,
            retrier: Retrier::default(),
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Apply the retry policy and timeouts of the monitor config
    pub fn with_monitor_config(self, config: &MonitorConfig) -> Self {
        self.with_retry(config.retry.clone())
            .with_cycle_timeout(config.cycle_timeout())
            .with_notify_timeout(config.notify_timeout())
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retrier = Retrier::new(config);
        self
    }

    pub fn with_cycle_timeout(mut self, cycle_timeout: Duration) -> Self {
        self.cycle_timeout = cycle_timeout;
        self
    }

    pub fn with_notify_timeout(mut self, notify_timeout: Duration) -> Self {
        self.notify_timeout = notify_timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run one cycle bounded by the cycle timeout
    pub async fn run_cycle(&self) -> Result<CycleReport, MonitorError> {
        let cancel = self.shutdown.child_token();

        match timeout(self.cycle_timeout, self.run_cycle_with_cancel(&cancel)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                warn!("monitoring cycle exceeded {:?}", self.cycle_timeout);
                Err(MonitorError::DeadlineExceeded(self.cycle_timeout))
            }
        }
    }

    /// Run one cycle until it completes or `cancel` fires
    ///
    /// Check tasks still running at cancellation keep running; their results
    /// are dropped.
    #[instrument(skip_all)]
    pub async fn run_cycle_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, MonitorError> {
        if cancel.is_cancelled() {
            return Err(MonitorError::Cancelled);
        }

        let endpoints = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MonitorError::Cancelled),
            fetched = self.repository.get_active_endpoints() => {
                fetched.map_err(MonitorError::EndpointFetch)?
            }
        };

        let active_ids: Vec<i64> = endpoints.iter().map(|e| e.id).collect();
        self.checker.retain_breakers(&active_ids).await;

        if endpoints.is_empty() {
            debug!("no active endpoints to check");
            return Ok(CycleReport::default());
        }

        info!("checking {} endpoints", endpoints.len());

        let (tx, mut rx) = mpsc::channel(endpoints.len());

        for endpoint in endpoints {
            let tx = tx.clone();
            let checker = self.checker.clone();

            tokio::spawn(async move {
                let result = checker.check(&endpoint).await;
                if tx.send(result).await.is_err() {
                    trace!("cycle gone, dropping result for endpoint {}", endpoint.id);
                }
            });
        }

        // only the check tasks hold senders now
        drop(tx);

        let mut report = CycleReport::default();

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("monitoring cycle cancelled after {} results", report.checked);
                    return Err(MonitorError::Cancelled);
                }
                next = rx.recv() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            report.checked += 1;
            self.handle_result(result, &mut report).await;
        }

        info!(
            "monitoring cycle complete: {} checked, {} persisted, {} persist failures",
            report.checked, report.persisted, report.persist_failures
        );

        Ok(report)
    }

    async fn handle_result(&self, result: MonitoringResult, report: &mut CycleReport) {
        if let Err(e) = self.repository.save_result(&result).await {
            error!("failed to save result for endpoint {}: {e}", result.endpoint_id);
            report.persist_failures += 1;
            return;
        }
        report.persisted += 1;

        self.broadcaster.broadcast(result.clone());
        self.spawn_stream_publish(result.clone());

        if let Some(notifier) = &self.notifier {
            self.spawn_alert_notification(notifier.clone(), result);
        }
    }

    fn spawn_stream_publish(&self, result: MonitoringResult) {
        let streams = self.streams.clone();
        let retrier = self.retrier.clone();
        let shutdown = self.shutdown.clone();
        let limit = self.notify_timeout;

        tokio::spawn(async move {
            let fields = result_stream_fields(&result);
            let publish = retrier.retry_with_cancel(&shutdown, || {
                streams.append(RESULT_STREAM, fields.clone())
            });

            match timeout(limit, publish).await {
                Ok(Ok(id)) => trace!("published result of endpoint {} as entry {id}", result.endpoint_id),
                Ok(Err(e)) => warn!("failed to publish result of endpoint {}: {e}", result.endpoint_id),
                Err(_) => warn!("publishing result of endpoint {} timed out", result.endpoint_id),
            }
        });
    }

    fn spawn_alert_notification(&self, notifier: Arc<dyn AlertNotifier>, result: MonitoringResult) {
        let retrier = self.retrier.clone();
        let shutdown = self.shutdown.clone();
        let limit = self.notify_timeout;

        tokio::spawn(async move {
            let notify = retrier.retry_with_cancel(&shutdown, || notifier.notify(&result));

            match timeout(limit, notify).await {
                Ok(Ok(())) => trace!("alert service notified for endpoint {}", result.endpoint_id),
                Ok(Err(e)) => warn!("failed to notify alert service for endpoint {}: {e}", result.endpoint_id),
                Err(_) => warn!("alert notification for endpoint {} timed out", result.endpoint_id),
            }
        });
    }

    /// Run a cycle every `interval` until `shutdown` fires
    ///
    /// A failed cycle is logged and the next one runs on schedule.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("monitoring scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            error!("monitoring cycle failed: {e}");
                        }
                    }
                }
            }
        })
    }
}
