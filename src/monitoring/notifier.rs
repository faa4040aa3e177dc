use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use super::AlertNotifier;
use crate::MonitoringResult;

/// Path of the evaluation endpoint on the alert service
pub const EVALUATE_ALERTS_PATH: &str = "/api/monitoring/evaluate-alerts";

/// Hands results to the external alert evaluation service
///
/// Rule evaluation happens there; this side only POSTs the result as JSON.
#[derive(Debug, Clone)]
pub struct HttpAlertNotifier {
    client: Client,
    evaluate_url: String,
}

impl HttpAlertNotifier {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            evaluate_url: format!("{}{EVALUATE_ALERTS_PATH}", base_url.trim_end_matches('/')),
        }
    }

    pub fn evaluate_url(&self) -> &str {
        &self.evaluate_url
    }
}

#[async_trait]
impl AlertNotifier for HttpAlertNotifier {
    /// Transport errors are returned so they can be retried; an unexpected
    /// status is only logged
    #[instrument(skip(self, result), fields(endpoint_id = result.endpoint_id))]
    async fn notify(&self, result: &MonitoringResult) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.evaluate_url)
            .json(result)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => {
                debug!("alert evaluation accepted");
            }
            status => {
                warn!("alert evaluation returned unexpected status: {status}");
                if let Ok(body) = response.text().await {
                    debug!("alert service response: {body}");
                }
            }
        }

        Ok(())
    }
}
