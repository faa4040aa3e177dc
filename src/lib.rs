pub mod config;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod monitoring;
pub mod resilience;
pub mod storage;

#[cfg(feature = "api")]
pub mod api;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored HTTP endpoint
///
/// Endpoints are managed elsewhere; the monitoring core only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    /// Check interval in seconds
    pub check_interval: u32,
    /// Per-request timeout in milliseconds
    pub timeout: u64,
    /// Raw JSON object of header names to values, applied verbatim on every check
    pub headers: Option<String>,
    pub is_active: bool,
}

impl Endpoint {
    /// Decode the header map, if any.
    ///
    /// Returns `Ok(empty)` when no headers are configured.
    pub fn header_map(&self) -> Result<HashMap<String, String>, serde_json::Error> {
        match self.headers.as_deref().map(str::trim) {
            None | Some("") | Some("null") => Ok(HashMap::new()),
            Some(raw) => serde_json::from_str(raw),
        }
    }
}

/// Outcome of a single endpoint check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringResult {
    pub endpoint_id: i64,
    /// Response time in milliseconds
    pub response_time: u64,
    /// Present iff the HTTP round trip completed
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl MonitoringResult {
    /// A completed round trip
    pub fn success(endpoint_id: i64, response_time: u64, status_code: u16) -> Self {
        Self {
            endpoint_id,
            response_time,
            status_code: Some(status_code),
            error_message: None,
            checked_at: Utc::now(),
        }
    }

    /// A check that never got a response
    pub fn failure(endpoint_id: i64, response_time: u64, error_message: impl Into<String>) -> Self {
        Self {
            endpoint_id,
            response_time,
            status_code: None,
            error_message: Some(error_message.into()),
            checked_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code.is_some() && self.error_message.is_none()
    }
}

/// Alert rule attached to an endpoint
///
/// Rules are evaluated by the external alert service; the monitor only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub user_id: i64,
    pub endpoint_id: i64,
    /// One of `response_time`, `status_code`, `availability`
    pub alert_type: String,
    /// Raw JSON threshold definition
    pub threshold: String,
    pub is_active: bool,
}
