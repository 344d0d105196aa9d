//! In-memory ledger used by tests and devnet runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::{LedgerError, LedgerOutcome, LedgerService};

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub user_id: String,
    /// Positive for credits, negative for debits
    pub delta: Decimal,
    pub idempotency_key: String,
    pub meta: serde_json::Value,
}

#[derive(Default)]
struct State {
    balances: HashMap<String, Decimal>,
    entries: Vec<LedgerEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<State>>,
    /// When false, debits may drive a balance negative
    enforce_balance: bool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that refuses debits larger than the balance
    pub fn strict() -> Self {
        Self {
            enforce_balance: true,
            ..Self::default()
        }
    }

    pub async fn deposit_funds(&self, user_id: &str, amount: Decimal) {
        let mut state = self.state.lock().await;
        *state.balances.entry(user_id.to_string()).or_default() += amount;
    }

    pub async fn balance(&self, user_id: &str) -> Decimal {
        let state = self.state.lock().await;
        state.balances.get(user_id).copied().unwrap_or_default()
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.entries.clone()
    }

    /// Entries applied under one idempotency key (at most one)
    pub async fn entries_for(&self, idempotency_key: &str) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|e| e.idempotency_key == idempotency_key)
            .cloned()
            .collect()
    }

    async fn apply(
        &self,
        user_id: &str,
        delta: Decimal,
        idempotency_key: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError> {
        if delta.is_zero() {
            return Err(LedgerError::Rejected("zero amount".to_string()));
        }

        let mut state = self.state.lock().await;
        if state.entries.iter().any(|e| e.idempotency_key == idempotency_key) {
            return Ok(LedgerOutcome::AlreadyApplied);
        }

        let balance = state.balances.get(user_id).copied().unwrap_or_default();
        if self.enforce_balance && balance + delta < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds(user_id.to_string()));
        }

        state.balances.insert(user_id.to_string(), balance + delta);
        state.entries.push(LedgerEntry {
            user_id: user_id.to_string(),
            delta,
            idempotency_key: idempotency_key.to_string(),
            meta,
        });
        Ok(LedgerOutcome::Applied)
    }
}

#[async_trait]
impl LedgerService for MemoryLedger {
    async fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError> {
        self.apply(user_id, amount.abs(), idempotency_key, meta).await
    }

    async fn debit(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError> {
        self.apply(user_id, -amount.abs(), idempotency_key, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_repeated_key_is_noop() {
        let ledger = MemoryLedger::new();
        let meta = serde_json::json!({"network": "eth"});

        let first = ledger.credit("u1", dec!(0.5), "dep_1", meta.clone()).await.unwrap();
        let second = ledger.credit("u1", dec!(0.5), "dep_1", meta).await.unwrap();

        assert_eq!(first, LedgerOutcome::Applied);
        assert_eq!(second, LedgerOutcome::AlreadyApplied);
        assert_eq!(ledger.balance("u1").await, dec!(0.5));
        assert_eq!(ledger.entries_for("dep_1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_strict_ledger_refuses_overdraft() {
        let ledger = MemoryLedger::strict();
        ledger.deposit_funds("u1", dec!(10)).await;

        let err = ledger
            .debit("u1", dec!(11), "wd_1", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds(_)));

        ledger.debit("u1", dec!(4), "wd_2", serde_json::Value::Null).await.unwrap();
        assert_eq!(ledger.balance("u1").await, dec!(6));
    }
}
