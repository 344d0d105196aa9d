//! Common Error Types for the Payments Pipeline
//!
//! Every module error rolls up into [`PaymentError`]. The consumer loop and
//! the supervisor only look at [`ErrorKind`] to decide between ack, nack and
//! restart.

use thiserror::Error;

use crate::bus::BusError;
use crate::chain::ChainError;
use crate::ledger::LedgerError;
use crate::lock::LockError;
use crate::storage::StorageError;

/// How a failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry later with backoff
    Transient,
    /// Permanently invalid input, never retried
    Validation,
    /// Terminal on-chain reversion
    Reversion,
    /// Already processed, treat as success
    Duplicate,
    /// Stop the worker and let the supervisor restart it
    Fatal,
}

/// Root error type for the payments pipeline
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Lock held by another worker, try again later
    #[error("resource busy: {0}")]
    LockBusy(String),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Unrecoverable state, the worker must stop
    #[error("fatal: {0}")]
    Fatal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PaymentError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn busy(resource: impl Into<String>) -> Self {
        Self::LockBusy(resource.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PaymentError::Config(_) | PaymentError::Logging(_) | PaymentError::Fatal(_) => {
                ErrorKind::Fatal
            }
            PaymentError::Chain(e) => e.kind(),
            PaymentError::Ledger(e) => e.kind(),
            PaymentError::Storage(e) => e.kind(),
            PaymentError::Lock(_) | PaymentError::LockBusy(_) | PaymentError::Io(_) => {
                ErrorKind::Transient
            }
            PaymentError::Bus(e) => e.kind(),
            PaymentError::Validation(_) => ErrorKind::Validation,
            PaymentError::Reverted(_) => ErrorKind::Reversion,
            PaymentError::Duplicate(_) => ErrorKind::Duplicate,
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Get error code for API responses and log lines
    pub fn error_code(&self) -> &'static str {
        match self {
            PaymentError::Config(_) => "CONFIG_ERROR",
            PaymentError::Logging(_) => "LOGGING_ERROR",
            PaymentError::Chain(_) => "CHAIN_ERROR",
            PaymentError::Ledger(_) => "LEDGER_ERROR",
            PaymentError::Storage(_) => "STORAGE_ERROR",
            PaymentError::Lock(_) => "LOCK_ERROR",
            PaymentError::Bus(_) => "BUS_ERROR",
            PaymentError::LockBusy(_) => "RESOURCE_BUSY",
            PaymentError::Validation(_) => "VALIDATION_ERROR",
            PaymentError::Reverted(_) => "REVERTED",
            PaymentError::Duplicate(_) => "DUPLICATE",
            PaymentError::Fatal(_) => "FATAL",
            PaymentError::Io(_) => "IO_ERROR",
        }
    }
}

// A rejected transition means the stored record disagrees with the worker's
// view of it; stop rather than guess.
impl From<crate::types::TransitionError> for PaymentError {
    fn from(e: crate::types::TransitionError) -> Self {
        PaymentError::Fatal(e.to_string())
    }
}

impl From<crate::types::WithdrawalTransitionError> for PaymentError {
    fn from(e: crate::types::WithdrawalTransitionError) -> Self {
        PaymentError::Fatal(e.to_string())
    }
}

/// Result type alias using PaymentError
pub type Result<T> = std::result::Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PaymentError::validation("amount below minimum");
        assert!(err.to_string().contains("amount below minimum"));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PaymentError::Chain(ChainError::Timeout).is_retryable());
        assert!(PaymentError::busy("withdraw:u1").is_retryable());
        assert!(!PaymentError::validation("invalid input").is_retryable());
        assert!(!PaymentError::fatal("corrupt record").is_retryable());
    }

    #[test]
    fn test_duplicate_storage_maps_to_duplicate() {
        let err = PaymentError::from(StorageError::Duplicate("eth:abc".to_string()));
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }
}
