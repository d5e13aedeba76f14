//! Operator notifications for task failures and sync completion.
//!
//! Delivery goes through an HTTP webhook; the mail bridge behind it is an
//! external collaborator. With `--mail` off everything is logged only.

use std::time::Duration;

#[derive(Clone)]
pub struct Alerter {
    enabled: bool,
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Alerter {
    pub fn new(enabled: bool, webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            enabled,
            webhook_url,
            client,
        }
    }

    /// Send a notification. Delivery failures are logged, never propagated —
    /// alerting must not take down the pipeline it reports on.
    pub async fn notify(&self, subject: &str, body: &str) {
        if !self.enabled {
            tracing::info!(subject, "alert (mail disabled): {body}");
            return;
        }
        let Some(url) = &self.webhook_url else {
            tracing::warn!(subject, "alert requested but ALERT_WEBHOOK_URL is not set");
            return;
        };
        let payload = serde_json::json!({ "subject": subject, "body": body });
        if let Err(e) = self.client.post(url).json(&payload).send().await {
            tracing::error!("failed to deliver alert '{subject}': {e}");
        }
    }
}
