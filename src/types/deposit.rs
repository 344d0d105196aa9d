//! Deposit Types
//!
//! Inbound transactions through their lifecycle:
//! initiated → pending → completed | cancelled

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{now_secs, Network};

/// Status of a deposit through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Seen by the watcher, no receipt fetched yet
    Initiated,
    /// Receipt observed, accumulating confirmations
    Pending,
    /// Finality reached and ledger credited
    Completed,
    /// Never credited (reverted or vanished)
    Cancelled,
}

impl DepositStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Initiated => 0,
            Self::Pending => 1,
            Self::Completed | Self::Cancelled => 2,
        }
    }

    /// Transitions only move forward and never leave a terminal state
    pub fn can_transition_to(&self, next: DepositStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl Default for DepositStatus {
    fn default() -> Self {
        Self::Initiated
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Reason codes recorded on cancelled deposits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    /// The transaction reverted on-chain, nothing was received
    NoTransaction,
}

impl CancelReason {
    pub fn code(&self) -> &'static str {
        match self {
            CancelReason::NoTransaction => "NO_TRANSACTION",
        }
    }
}

/// Attempted an illegal status change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal deposit transition {from} -> {to}")]
pub struct TransitionError {
    pub from: DepositStatus,
    pub to: DepositStatus,
}

/// A single inbound on-chain transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositTransaction {
    /// Internal identity, also the ledger idempotency key
    pub id: String,
    pub user_id: String,
    pub network: Network,
    /// Chain transaction hash
    pub external_id: String,
    /// Receiving address
    pub address: String,
    pub amount: Decimal,
    pub status: DepositStatus,
    pub confirmations: u32,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    /// Set on cancellation
    pub reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DepositTransaction {
    /// Create a freshly detected deposit
    pub fn new(
        user_id: String,
        network: Network,
        external_id: String,
        address: String,
        amount: Decimal,
    ) -> Self {
        let now = now_secs();

        Self {
            id: format!("dep_{}", uuid::Uuid::new_v4().simple()),
            user_id,
            network,
            external_id,
            address,
            amount,
            status: DepositStatus::Initiated,
            confirmations: 0,
            block_number: None,
            block_hash: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Lock resource key for this deposit
    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.network, self.external_id)
    }

    fn transition(&mut self, next: DepositStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Receipt observed for the first time
    pub fn mark_pending(&mut self) -> Result<(), TransitionError> {
        self.transition(DepositStatus::Pending)
    }

    /// Record block inclusion and a new confirmation count.
    ///
    /// Confirmations never decrease and a known block height is never erased.
    pub fn update_confirmations(
        &mut self,
        confirmations: u32,
        block_number: Option<u64>,
        block_hash: Option<String>,
    ) {
        self.confirmations = self.confirmations.max(confirmations);
        if block_number.is_some() {
            self.block_number = block_number;
        }
        if block_hash.is_some() {
            self.block_hash = block_hash;
        }
        self.touch();
    }

    pub fn mark_completed(&mut self) -> Result<(), TransitionError> {
        self.transition(DepositStatus::Completed)
    }

    pub fn mark_cancelled(&mut self, reason: CancelReason) -> Result<(), TransitionError> {
        self.transition(DepositStatus::Cancelled)?;
        self.reason = Some(reason.code().to_string());
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn deposit() -> DepositTransaction {
        DepositTransaction::new(
            "user_1".to_string(),
            Network::Eth,
            "0xabc".to_string(),
            "0xaddr".to_string(),
            dec!(0.5),
        )
    }

    #[test]
    fn test_deposit_lifecycle() {
        let mut record = deposit();
        assert!(record.id.starts_with("dep_"));
        assert_eq!(record.status, DepositStatus::Initiated);

        record.mark_pending().unwrap();
        record.update_confirmations(2, Some(45), Some("0xblock".to_string()));
        assert_eq!(record.confirmations, 2);

        record.mark_completed().unwrap();
        assert_eq!(record.status, DepositStatus::Completed);
        assert!(record.status.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut record = deposit();
        record.mark_pending().unwrap();
        record.mark_cancelled(CancelReason::NoTransaction).unwrap();
        assert_eq!(record.reason.as_deref(), Some("NO_TRANSACTION"));

        assert!(record.mark_completed().is_err());
        assert!(record.mark_pending().is_err());
        assert_eq!(record.status, DepositStatus::Cancelled);
    }

    #[test]
    fn test_no_backward_transition() {
        let mut record = deposit();
        record.mark_pending().unwrap();
        let err = record.mark_pending().unwrap_err();
        assert_eq!(err.from, DepositStatus::Pending);
    }

    #[test]
    fn test_confirmations_never_decrease() {
        let mut record = deposit();
        record.update_confirmations(5, Some(100), None);
        record.update_confirmations(3, None, None);
        assert_eq!(record.confirmations, 5);
        assert_eq!(record.block_number, Some(100));
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!("pending".parse::<DepositStatus>(), Ok(DepositStatus::Pending));
        assert_eq!(DepositStatus::Cancelled.to_string(), "cancelled");
    }
}
