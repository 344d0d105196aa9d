//! Structured Logging for the Payments Pipeline
//!
//! - JSON output for log aggregation on mainnet, pretty output elsewhere
//! - Correlation IDs that follow a message across workers
//! - Category helpers for deposit, withdrawal, pooling and security events
//!
//! # Usage
//!
//! ```rust,ignore
//! use payments::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?;
//! tracing::info!(target: "payments::deposit", deposit_id = %id, "credited");
//! ```

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::types::Network;

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Deposit,
    Withdrawal,
    Pooling,
    /// Webhook authentication, address validation failures
    Security,
    /// Startup, shutdown, restarts
    System,
    Error,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_filter().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"error\": \"failed to serialize log\", \"message\": {:?}}}", self.message)
        })
    }
}

// ============================================================================
// Category Helpers
// ============================================================================

/// Log a security-related event
pub fn log_security_event(
    event_type: &str,
    success: bool,
    details: serde_json::Value,
    correlation_id: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Security, event_type).with_data(
        serde_json::json!({
            "success": success,
            "details": details
        }),
    );
    if let Some(id) = correlation_id {
        event = event.with_correlation_id(id);
    }

    if success {
        tracing::info!(target: "payments::security", "{}", event.to_json());
    } else {
        tracing::warn!(target: "payments::security", "{}", event.to_json());
    }
}

/// Log a deposit lifecycle event
pub fn log_deposit_event(
    event_type: &str,
    deposit_id: &str,
    network: Network,
    external_id: &str,
    amount: Decimal,
    error: Option<&str>,
) {
    let mut event = LogEvent::new(
        if error.is_some() { LogLevel::Error } else { LogLevel::Info },
        EventCategory::Deposit,
        event_type,
    )
    .with_correlation_id(deposit_id)
    .with_data(serde_json::json!({
        "deposit_id": deposit_id,
        "network": network,
        "external_id": external_id,
        "amount": amount.to_string(),
    }));

    match error {
        Some(err) => {
            event = event.with_error("DEPOSIT_ERROR", err);
            tracing::error!(target: "payments::deposit", "{}", event.to_json());
        }
        None => tracing::info!(target: "payments::deposit", "{}", event.to_json()),
    }
}

/// Log a withdrawal lifecycle event
pub fn log_withdrawal_event(
    event_type: &str,
    withdrawal_id: &str,
    network: Network,
    amount: Decimal,
    destination: &str,
    external_id: Option<&str>,
    error: Option<&str>,
) {
    let mut event = LogEvent::new(
        if error.is_some() { LogLevel::Error } else { LogLevel::Info },
        EventCategory::Withdrawal,
        event_type,
    )
    .with_correlation_id(withdrawal_id)
    .with_data(serde_json::json!({
        "withdrawal_id": withdrawal_id,
        "network": network,
        "amount": amount.to_string(),
        "destination": destination,
        "external_id": external_id,
    }));

    match error {
        Some(err) => {
            event = event.with_error("WITHDRAWAL_ERROR", err);
            tracing::error!(target: "payments::withdrawal", "{}", event.to_json());
        }
        None => tracing::info!(target: "payments::withdrawal", "{}", event.to_json()),
    }
}

/// Log the outcome of one sweep pass
pub fn log_pooling_event(record: &crate::types::PoolingRecord, duration_ms: u64) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Pooling, record.to_string())
        .with_duration(duration_ms)
        .with_data(serde_json::to_value(record).unwrap_or_default());

    tracing::info!(target: "payments::pooling", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// `RUST_LOG` overrides the level when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let l = level.as_filter();
        EnvFilter::new(format!("payments={l},tower_http={l},axum={l}"))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from PaymentsConfig
pub fn init_from_config(config: &super::config::PaymentsConfig) -> Result<(), LoggingError> {
    let level = LogLevel::from(config.log_level.as_str());
    let json_format = config.environment == super::config::Environment::Mainnet;

    init_logging(level, json_format)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation ID for message tracing
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Deposit, "credited")
            .with_correlation_id("dep-123")
            .with_data(serde_json::json!({"network": "eth"}))
            .with_duration(42);

        let json = event.to_json();
        assert!(json.contains("credited"));
        assert!(json.contains("dep-123"));
        assert!(json.contains("\"duration_ms\":42"));
        assert!(json.contains("\"category\":\"deposit\""));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let id1 = generate_correlation_id();
        let id2 = generate_correlation_id();
        assert_eq!(id1.len(), 32);
        assert_ne!(id1, id2);
    }
}
