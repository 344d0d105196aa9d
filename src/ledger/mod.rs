//! Ledger Service
//!
//! The internal balance ledger is owned by another service. The pipeline only
//! ever moves money through `credit` and `debit`, each carrying an
//! idempotency key; replaying a key is a successful no-op.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::common::ErrorKind;

pub use http::HttpLedgerClient;
pub use memory::MemoryLedger;

/// Result of a ledger mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Applied,
    /// The idempotency key was seen before, nothing changed
    AlreadyApplied,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Transport(String),

    #[error("ledger server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("insufficient funds for user {0}")]
    InsufficientFunds(String),

    #[error("ledger rejected request: {0}")]
    Rejected(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Transport(_) | LedgerError::Server { .. } => ErrorKind::Transient,
            LedgerError::InsufficientFunds(_) | LedgerError::Rejected(_) => ErrorKind::Validation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        LedgerError::Transport(e.to_string())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError>;

    async fn debit(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(LedgerError::Transport("reset".into()).is_retryable());
        assert!(LedgerError::Server { status: 503, body: String::new() }.is_retryable());
        assert_eq!(
            LedgerError::InsufficientFunds("u1".into()).kind(),
            ErrorKind::Validation
        );
    }
}
