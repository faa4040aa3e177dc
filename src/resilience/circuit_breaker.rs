//! Three-state circuit breaker
//!
//! ## State machine
//!
//! ```text
//!            max_failures consecutive failures
//!   Closed ───────────────────────────────────→ Open
//!     ↑                                          │
//!     │ 2 consecutive successes                  │ reset_interval since last failure
//!     │                                          ↓
//!     └──────────────────────────────────── HalfOpen
//!                  any failure → Open
//! ```
//!
//! The breaker only counts outcomes, it never looks at error content.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::duration_from_secs;

const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive successes needed in half-open before the circuit closes
const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub max_failures: u32,
    #[serde(rename = "reset_interval_secs", deserialize_with = "duration_from_secs")]
    pub reset_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_failures: DEFAULT_MAX_FAILURES,
            reset_interval: DEFAULT_RESET_INTERVAL,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open and the call was rejected without running
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The cancellation token fired before the call completed
    #[error("circuit breaker '{name}' call cancelled")]
    Cancelled { name: String },

    /// The wrapped operation ran and failed
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }
}

/// Point-in-time view of the breaker, taken under its lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(mut config: CircuitBreakerConfig) -> Self {
        if config.max_failures == 0 {
            config.max_failures = DEFAULT_MAX_FAILURES;
        }
        if config.reset_interval.is_zero() {
            config.reset_interval = DEFAULT_RESET_INTERVAL;
        }

        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `op` through the breaker
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        let result = op().await;
        self.record(result.is_ok()).await;
        result.map_err(CircuitBreakerError::Inner)
    }

    /// Run `op` through the breaker, abandoning it when `cancel` fires
    ///
    /// An abandoned call counts as neither success nor failure.
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(self.cancelled());
        }

        self.admit().await?;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(breaker = %self.config.name, "call cancelled, outcome not recorded");
                Err(self.cancelled())
            }

            result = op() => {
                self.record(result.is_ok()).await;
                result.map_err(CircuitBreakerError::Inner)
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
        }
    }

    /// Force the breaker closed and clear its counters
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.last_failure = None;
        info!(breaker = %self.config.name, "circuit breaker reset");
    }

    fn cancelled<E>(&self) -> CircuitBreakerError<E> {
        CircuitBreakerError::Cancelled {
            name: self.config.name.clone(),
        }
    }

    /// Decide whether a call may proceed, moving open → half-open once the
    /// reset interval has passed
    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.inner.lock().await;

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .last_failure
                .is_none_or(|at| at.elapsed() >= self.config.reset_interval);

            if !cooled_down {
                return Err(CircuitBreakerError::Open {
                    name: self.config.name.clone(),
                });
            }

            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
            info!(breaker = %self.config.name, "circuit breaker half-open");
        }

        Ok(())
    }

    async fn record(&self, success: bool) {
        let mut inner = self.inner.lock().await;

        if success {
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= HALF_OPEN_SUCCESS_THRESHOLD {
                        inner.state = CircuitState::Closed;
                        inner.failures = 0;
                        inner.successes = 0;
                        info!(breaker = %self.config.name, "circuit breaker closed");
                    }
                }
                CircuitState::Closed => inner.failures = 0,
                // a call admitted before another one tripped the breaker
                CircuitState::Open => {}
            }
            return;
        }

        inner.failures = inner.failures.saturating_add(1);
        inner.successes = 0;
        inner.last_failure = Some(Instant::now());

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.config.max_failures,
            CircuitState::Open => false,
        };

        if trip {
            inner.state = CircuitState::Open;
            warn!(
                breaker = %self.config.name,
                failures = inner.failures,
                "circuit breaker opened"
            );
        }
    }
}
