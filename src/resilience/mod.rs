//! Resilience primitives shared by the endpoint checker and the publishers
//!
//! - [`Retrier`]: bounded attempts with exponential backoff and jitter
//! - [`CircuitBreaker`]: closed / open / half-open gate around a flaky dependency

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
pub use retry::{Retrier, RetryConfig, RetryError, is_retryable_error};
