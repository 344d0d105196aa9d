//! Operator Alerts
//!
//! Raised when automation gives up: reconnect attempts exhausted, messages
//! dead-lettered, workers out of restarts, withdrawals flagged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    /// Component raising the alert, e.g. `deposit-watcher:eth`
    pub source: String,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: String,
}

impl Alert {
    pub fn new(severity: Severity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.into(),
            message: message.into(),
            details: serde_json::Value::Null,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Delivers alerts. Delivery failures are logged, never returned.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, alert: Alert);
}

fn log_alert(alert: &Alert) {
    let json = serde_json::to_string(alert).unwrap_or_else(|_| alert.message.clone());
    match alert.severity {
        Severity::Critical => tracing::error!(target: "payments::alert", "{}", json),
        Severity::Warning => tracing::warn!(target: "payments::alert", "{}", json),
    }
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, alert: Alert) {
        log_alert(&alert);
    }
}

/// Logs and POSTs alerts as JSON to an operator webhook
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, alert: Alert) {
        log_alert(&alert);

        let result = self
            .client
            .post(&self.url)
            .json(&alert)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        if let Err(e) = result {
            tracing::error!(target: "payments::alert", error = %e, "failed to deliver alert webhook");
        }
    }
}

/// Keeps alerts in memory so tests can assert on them
#[derive(Debug, Default, Clone)]
pub struct RecordingAlerter {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn alert(&self, alert: Alert) {
        log_alert(&alert);
        self.alerts.lock().await.push(alert);
    }
}

/// Webhook alerter when configured, log alerter otherwise
pub fn from_config(webhook: Option<&str>) -> Arc<dyn Alerter> {
    match webhook {
        Some(url) => Arc::new(WebhookAlerter::new(url)),
        None => Arc::new(LogAlerter),
    }
}
