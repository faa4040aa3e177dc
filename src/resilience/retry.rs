//! Retry with exponential backoff
//!
//! ## Delay schedule
//!
//! ```text
//! delay(attempt) = min(max_delay, initial_delay * multiplier^attempt)  (+ jitter in [0, delay/4))
//! ```
//!
//! With the defaults (100ms, x2.0, 10s cap) the waits between attempts are
//! 100ms, 200ms, 400ms, ... until the cap is reached. No wait follows the last
//! attempt.
//!
//! The executor retries every error. `is_retryable_error` is available for
//! callers that want to classify network failures before retrying.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::duration_from_millis;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Lower-cased fragments of error messages that usually indicate a transient network failure
const RETRYABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "temporary failure",
    "deadline exceeded",
    "no such host",
    "broken pipe",
    "connection timeout",
    "read timeout",
    "write timeout",
    "network unreachable",
    "too many open files",
];

/// Retry policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    #[serde(rename = "initial_delay_ms", deserialize_with = "duration_from_millis")]
    pub initial_delay: Duration,

    #[serde(rename = "max_delay_ms", deserialize_with = "duration_from_millis")]
    pub max_delay: Duration,

    pub multiplier: f64,

    /// Add up to 25% random jitter to every delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Replace zero or non-positive values with the defaults
    fn normalized(mut self) -> Self {
        if self.max_attempts == 0 {
            self.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        if self.initial_delay.is_zero() {
            self.initial_delay = DEFAULT_INITIAL_DELAY;
        }
        if self.max_delay.is_zero() {
            self.max_delay = DEFAULT_MAX_DELAY;
        }
        if !(self.multiplier > 0.0) || !self.multiplier.is_finite() {
            self.multiplier = DEFAULT_MULTIPLIER;
        }
        self
    }
}

/// Error returned when an operation could not be completed
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the error of the final attempt
    #[error("max retries ({attempts}) exceeded: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The cancellation token fired before an attempt or during a backoff sleep
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Error of the final attempt, if the budget was exhausted
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled => None,
        }
    }
}

/// Runs fallible async operations with bounded attempts and exponential backoff
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds or the attempt budget is spent
    pub async fn retry<F, Fut, T, E>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            attempt += 1;
            trace!("attempt {attempt}/{} failed", self.config.max_attempts);

            if attempt >= self.config.max_attempts {
                debug!("giving up after {attempt} attempts");
                return Err(RetryError::Exhausted {
                    attempts: self.config.max_attempts,
                    last: error,
                });
            }

            tokio::time::sleep(self.calculate_delay(attempt - 1)).await;
        }
    }

    /// Like [`Retrier::retry`], but gives up as soon as `cancel` fires
    ///
    /// Cancellation is observed before each attempt and during backoff sleeps.
    /// A cancelled run always reports [`RetryError::Cancelled`], never the last
    /// operation error.
    pub async fn retry_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            attempt += 1;
            trace!("attempt {attempt}/{} failed", self.config.max_attempts);

            if attempt >= self.config.max_attempts {
                debug!("giving up after {attempt} attempts");
                return Err(RetryError::Exhausted {
                    attempts: self.config.max_attempts,
                    last: error,
                });
            }

            let delay = self.calculate_delay(attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cancelled during backoff after {attempt} attempts");
                    return Err(RetryError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Backoff before the attempt following `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let max_nanos = self.config.max_delay.as_nanos() as f64;
        let nanos = self.config.initial_delay.as_nanos() as f64
            * self
                .config
                .multiplier
                .powi(attempt.min(i32::MAX as u32) as i32);

        let mut delay = if nanos >= max_nanos {
            self.config.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        };

        if self.config.jitter {
            let quarter = (delay / 4).as_nanos() as u64;
            if quarter > 0 {
                delay += Duration::from_nanos(rand::thread_rng().gen_range(0..quarter));
            }
        }

        delay
    }
}

/// Whether an error message looks like a transient network failure
pub fn is_retryable_error(error: &impl std::fmt::Display) -> bool {
    let message = error.to_string().to_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}
