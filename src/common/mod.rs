//! Common Infrastructure Module
//!
//! Configuration, logging, errors, retry policy and process health shared by
//! every worker.

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod retry;

// Re-exports for convenience
pub use config::{ChainConfig, ConfigError, Environment, PaymentsConfig};
pub use error::{ErrorKind, PaymentError, Result};
pub use health::{Health, HealthState};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_deposit_event,
    log_pooling_event, log_security_event, log_withdrawal_event, EventCategory, LogEvent,
    LogLevel, LoggingError,
};
pub use retry::{retry_transient, RetryPolicy, Retryable};
