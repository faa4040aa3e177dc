//! Endpoint monitoring
//!
//! ## Cycle
//!
//! ```text
//! EndpointRepository ──active endpoints──→ MonitoringOrchestrator
//!                                              │ one task per endpoint
//!                                              ↓
//!                                        EndpointChecker (breaker → retrier → HTTP probe)
//!                                              │ results over mpsc
//!                                              ↓
//!     save_result → ResultBroadcaster → (detached) StreamSink + AlertNotifier
//! ```

pub mod checker;
pub mod error;
pub mod notifier;
pub mod service;

use async_trait::async_trait;

use crate::MonitoringResult;

pub use checker::{EndpointChecker, INVALID_URL_MESSAGE, ProbeError, is_valid_endpoint_url};
pub use error::MonitorError;
pub use notifier::HttpAlertNotifier;
pub use service::{CycleReport, MonitoringOrchestrator, RESULT_STREAM, result_stream_fields};

/// Delivers results to live subscribers
///
/// Implementations must never block the caller; dropping a result under
/// load is acceptable.
pub trait ResultBroadcaster: Send + Sync {
    fn broadcast(&self, result: MonitoringResult);
}

/// Forwards a persisted result to whatever evaluates alert rules
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, result: &MonitoringResult) -> anyhow::Result<()>;
}
