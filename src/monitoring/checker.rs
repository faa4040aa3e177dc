//! EndpointChecker - turns one endpoint into exactly one MonitoringResult
//!
//! ## Check pipeline
//!
//! ```text
//! URL validation ──invalid──→ failed result (no network, no breaker, no retry)
//!       │
//!       ↓
//! per-endpoint CircuitBreaker → Retrier → HTTP GET (endpoint timeout, endpoint headers)
//! ```
//!
//! Any HTTP response counts as a completed probe, whatever the status code.
//! Only transport failures and timeouts are retried and fed to the breaker.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::config::MonitorConfig;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, Retrier, RetryConfig};
use crate::{Endpoint, MonitoringResult};

pub const INVALID_URL_MESSAGE: &str = "invalid endpoint URL format";

/// Why a single HTTP probe failed
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, elapsed_ms: u64 },

    #[error("{message}")]
    Transport { message: String, elapsed_ms: u64 },
}

impl ProbeError {
    /// Milliseconds between dispatch and the failure
    pub fn elapsed_ms(&self) -> u64 {
        match self {
            ProbeError::Timeout { elapsed_ms, .. } | ProbeError::Transport { elapsed_ms, .. } => {
                *elapsed_ms
            }
        }
    }
}

/// A URL is checkable when it parses and has both a scheme and a host
pub fn is_valid_endpoint_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(url) => !url.scheme().is_empty() && url.host_str().is_some_and(|h| !h.is_empty()),
        Err(_) => false,
    }
}

pub struct EndpointChecker {
    /// Shared client; its timeout is only a fallback, every request carries the endpoint's own
    client: Client,
    retrier: Retrier,
    breaker_template: CircuitBreakerConfig,
    breakers: Mutex<HashMap<i64, Arc<CircuitBreaker>>>,
}

impl EndpointChecker {
    pub fn new(client: Client, retry: RetryConfig, breaker_template: CircuitBreakerConfig) -> Self {
        Self {
            client,
            retrier: Retrier::new(retry),
            breaker_template,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.http_timeout()).build()?;
        Ok(Self::new(
            client,
            config.retry.clone(),
            config.breaker.clone(),
        ))
    }

    /// Forget the breakers of endpoints that are no longer active
    pub async fn retain_breakers(&self, active_ids: &[i64]) {
        let mut breakers = self.breakers.lock().await;
        let before = breakers.len();
        breakers.retain(|id, _| active_ids.contains(id));

        let removed = before - breakers.len();
        if removed > 0 {
            debug!("dropped {removed} breakers of inactive endpoints");
        }
    }

    pub async fn breaker_count(&self) -> usize {
        self.breakers.lock().await.len()
    }

    /// The breaker guarding one endpoint, created closed on first use
    pub async fn breaker_for(&self, endpoint_id: i64) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(endpoint_id)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                    name: format!("{}-{endpoint_id}", self.breaker_template.name),
                    ..self.breaker_template.clone()
                }))
            })
            .clone()
    }

    /// Check one endpoint; failures are encoded in the result
    #[instrument(skip(self, endpoint), fields(endpoint_id = endpoint.id))]
    pub async fn check(&self, endpoint: &Endpoint) -> MonitoringResult {
        if !is_valid_endpoint_url(&endpoint.url) {
            warn!(failure = "invalid_url", "invalid endpoint URL: {:?}", endpoint.url);
            return MonitoringResult::failure(endpoint.id, 0, INVALID_URL_MESSAGE);
        }

        let headers = request_headers(endpoint);
        let breaker = self.breaker_for(endpoint.id).await;

        let outcome = breaker
            .execute(|| self.retrier.retry(|| self.probe(endpoint, &headers)))
            .await;

        match outcome {
            Ok((status_code, elapsed_ms)) => {
                trace!("{} answered {status_code} in {elapsed_ms}ms", endpoint.url);
                MonitoringResult::success(endpoint.id, elapsed_ms, status_code)
            }
            Err(e) => {
                let elapsed_ms = match &e {
                    CircuitBreakerError::Inner(retry) => {
                        retry.last_error().map_or(0, ProbeError::elapsed_ms)
                    }
                    _ => 0,
                };

                if e.is_open() {
                    warn!(failure = "circuit_open", "skipping check: {e}");
                } else {
                    warn!(failure = "probe", "check failed: {e}");
                }

                MonitoringResult::failure(endpoint.id, elapsed_ms, format!("request failed: {e}"))
            }
        }
    }

    async fn probe(&self, endpoint: &Endpoint, headers: &HeaderMap) -> Result<(u16, u64), ProbeError> {
        let mut request = self.client.get(&endpoint.url).headers(headers.clone());
        if endpoint.timeout > 0 {
            request = request.timeout(Duration::from_millis(endpoint.timeout));
        }

        let start = Instant::now();
        let response = request.send().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(response) => Ok((response.status().as_u16(), elapsed_ms)),
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout {
                timeout_ms: endpoint.timeout,
                elapsed_ms,
            }),
            Err(e) => Err(ProbeError::Transport {
                message: error_chain(&e),
                elapsed_ms,
            }),
        }
    }
}

/// Header map of an endpoint; malformed JSON or invalid entries are skipped
fn request_headers(endpoint: &Endpoint) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let raw = match endpoint.header_map() {
        Ok(raw) => raw,
        Err(e) => {
            warn!("ignoring malformed headers of endpoint {}: {e}", endpoint.id);
            return headers;
        }
    };

    for (name, value) in raw {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("ignoring invalid header {name:?} of endpoint {}", endpoint.id),
        }
    }

    debug!("applying {} headers", headers.len());
    headers
}

/// Display an error together with its sources, `outer: inner: root`
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
