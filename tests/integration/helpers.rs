//! Helper functions for integration tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_monitor::{
    Endpoint, MonitoringResult,
    monitoring::{EndpointChecker, ResultBroadcaster},
    resilience::{CircuitBreakerConfig, RetryConfig},
};
use reqwest::Client;

pub fn create_test_endpoint(id: i64, url: &str) -> Endpoint {
    Endpoint {
        id,
        user_id: 1,
        url: url.to_string(),
        check_interval: 60,
        timeout: 2000,
        headers: None,
        is_active: true,
    }
}

/// Fast retries so failure paths finish within a few hundred milliseconds
pub fn fast_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
        jitter: false,
    }
}

pub fn create_test_checker() -> Arc<EndpointChecker> {
    Arc::new(EndpointChecker::new(
        Client::new(),
        fast_retry_config(),
        CircuitBreakerConfig::named("test"),
    ))
}

/// Broadcaster keeping everything it was handed
#[derive(Default)]
pub struct RecordingBroadcaster {
    pub results: Mutex<Vec<MonitoringResult>>,
}

impl RecordingBroadcaster {
    pub fn endpoint_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .results
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.endpoint_id)
            .collect();
        ids.sort();
        ids
    }
}

impl ResultBroadcaster for RecordingBroadcaster {
    fn broadcast(&self, result: MonitoringResult) {
        self.results.lock().unwrap().push(result);
    }
}
