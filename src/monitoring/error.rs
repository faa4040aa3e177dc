use std::time::Duration;

use crate::storage::StorageError;

/// Errors that fail a whole monitoring cycle
///
/// Failures of single endpoints never surface here, they are recorded in
/// the endpoint's result.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitoring cycle cancelled")]
    Cancelled,

    #[error("monitoring cycle exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("failed to get active endpoints: {0}")]
    EndpointFetch(#[source] StorageError),
}
