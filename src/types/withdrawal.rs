//! Withdrawal Types
//!
//! Outbound transfers requested by the product layer.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{now_secs, Network};

/// Status of a withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// Request accepted, nothing debited yet
    Waiting,
    /// Balance reserved, about to sign and broadcast
    Processing,
    /// Broadcast, waiting for finality
    Sending,
    /// Final on-chain
    Finished,
    /// Signing, broadcast or on-chain failure (refunded)
    Failed,
    /// Rejected by an operator (refunded)
    Rejected,
    /// Held for manual review
    Flagged,
}

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Rejected)
    }

    pub fn can_transition_to(&self, next: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, next),
            (Waiting, Processing)
                | (Waiting, Failed)
                | (Processing, Sending)
                | (Processing, Flagged)
                | (Processing, Failed)
                | (Flagged, Processing)
                | (Flagged, Rejected)
                | (Sending, Finished)
                | (Sending, Failed)
                | (Sending, Flagged)
        )
    }
}

impl Default for WithdrawalStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Processing => write!(f, "processing"),
            Self::Sending => write!(f, "sending"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Flagged => write!(f, "flagged"),
        }
    }
}

impl std::str::FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "processing" => Ok(Self::Processing),
            "sending" => Ok(Self::Sending),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            "flagged" => Ok(Self::Flagged),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal withdrawal transition {from} -> {to}")]
pub struct WithdrawalTransitionError {
    pub from: WithdrawalStatus,
    pub to: WithdrawalStatus,
}

/// A single outbound transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalTransaction {
    /// Producer request id, also the ledger debit key
    pub id: String,
    pub user_id: String,
    pub network: Network,
    pub destination_address: String,
    pub destination_tag: Option<u32>,
    pub amount: Decimal,
    /// Network fee paid by the hot wallet
    pub fee: Option<Decimal>,
    pub status: WithdrawalStatus,
    /// Broadcast hash
    pub external_id: Option<String>,
    pub retries: u32,
    /// Whether the ledger reservation is in force
    pub debited: bool,
    pub reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl WithdrawalTransaction {
    pub fn new(request: &WithdrawalRequested) -> Self {
        let now = now_secs();

        Self {
            id: request.request_id.clone(),
            user_id: request.user_id.clone(),
            network: request.network,
            destination_address: request.destination.clone(),
            destination_tag: request.destination_tag,
            amount: request.amount,
            fee: None,
            status: WithdrawalStatus::Waiting,
            external_id: None,
            retries: 0,
            debited: false,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Ledger key for the compensating credit
    pub fn refund_key(&self) -> String {
        format!("{}:refund", self.id)
    }

    fn transition(&mut self, next: WithdrawalStatus) -> Result<(), WithdrawalTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(WithdrawalTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Balance reserved
    pub fn mark_processing(&mut self) -> Result<(), WithdrawalTransitionError> {
        self.transition(WithdrawalStatus::Processing)?;
        self.debited = true;
        Ok(())
    }

    pub fn mark_flagged(&mut self, reason: impl Into<String>) -> Result<(), WithdrawalTransitionError> {
        self.transition(WithdrawalStatus::Flagged)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_sending(
        &mut self,
        external_id: String,
        fee: Decimal,
    ) -> Result<(), WithdrawalTransitionError> {
        self.transition(WithdrawalStatus::Sending)?;
        self.external_id = Some(external_id);
        self.fee = Some(fee);
        Ok(())
    }

    pub fn mark_finished(&mut self) -> Result<(), WithdrawalTransitionError> {
        self.transition(WithdrawalStatus::Finished)
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), WithdrawalTransitionError> {
        self.transition(WithdrawalStatus::Failed)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>) -> Result<(), WithdrawalTransitionError> {
        self.transition(WithdrawalStatus::Rejected)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    /// The compensating credit was applied
    pub fn mark_refunded(&mut self) {
        self.debited = false;
        self.touch();
    }

    pub fn increment_retries(&mut self) {
        self.retries += 1;
        self.touch();
    }

    /// Whether a refund is still owed
    pub fn needs_refund(&self) -> bool {
        self.debited && matches!(self.status, WithdrawalStatus::Failed | WithdrawalStatus::Rejected)
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

/// Message produced by the product layer on `payments.withdrawalRequest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequested {
    pub request_id: String,
    pub user_id: String,
    pub network: Network,
    pub amount: Decimal,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_tag: Option<u32>,
}

/// Operator verdict on a flagged withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// Message on `payments.withdrawalReview`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReview {
    pub withdrawal_id: String,
    pub decision: ReviewDecision,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Withdrawal worker statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WithdrawalStats {
    pub requested: u64,
    pub sent: u64,
    pub finished: u64,
    pub failed: u64,
    pub rejected: u64,
    pub flagged: u64,
    pub refunded: u64,
}

impl std::fmt::Display for WithdrawalStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Withdrawals: {} requested | {} sent | {} finished | {} failed | {} rejected | {} flagged",
            self.requested, self.sent, self.finished, self.failed, self.rejected, self.flagged
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> WithdrawalRequested {
        WithdrawalRequested {
            request_id: "wd_1".to_string(),
            user_id: "user_1".to_string(),
            network: Network::Xrp,
            amount: dec!(25),
            destination: "rDest".to_string(),
            destination_tag: Some(7),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut wd = WithdrawalTransaction::new(&request());
        assert_eq!(wd.status, WithdrawalStatus::Waiting);
        assert!(!wd.debited);

        wd.mark_processing().unwrap();
        assert!(wd.debited);
        wd.mark_sending("HASH".to_string(), dec!(0.000015)).unwrap();
        wd.mark_finished().unwrap();

        assert!(wd.status.is_terminal());
        assert!(!wd.needs_refund());
    }

    #[test]
    fn test_failed_needs_refund_once() {
        let mut wd = WithdrawalTransaction::new(&request());
        wd.mark_processing().unwrap();
        wd.mark_failed("broadcast rejected").unwrap();
        assert!(wd.needs_refund());

        wd.mark_refunded();
        assert!(!wd.needs_refund());
        assert_eq!(wd.refund_key(), "wd_1:refund");
    }

    #[test]
    fn test_flagged_paths() {
        let mut wd = WithdrawalTransaction::new(&request());
        wd.mark_processing().unwrap();
        wd.mark_flagged("review threshold").unwrap();
        assert!(wd.mark_sending("x".to_string(), dec!(0)).is_err());

        wd.mark_rejected("operator").unwrap();
        assert!(wd.needs_refund());
    }

    #[test]
    fn test_unconfirmed_broadcast_can_be_flagged() {
        let mut wd = WithdrawalTransaction::new(&request());
        wd.mark_processing().unwrap();
        wd.mark_sending("HASH".to_string(), dec!(0.000015)).unwrap();
        wd.mark_flagged("no receipt").unwrap();
        // Still reserved until an operator decides
        assert!(wd.debited);
        assert!(!wd.needs_refund());
        assert_eq!(wd.external_id.as_deref(), Some("HASH"));
    }

    #[test]
    fn test_finished_is_final() {
        let mut wd = WithdrawalTransaction::new(&request());
        wd.mark_processing().unwrap();
        wd.mark_sending("h".to_string(), dec!(1)).unwrap();
        wd.mark_finished().unwrap();
        assert!(wd.mark_finished().is_err());
        assert!(wd.mark_failed("late").is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"requestId":"r1","userId":"u1","network":"xrp","amount":"25","destination":"rDest","destinationTag":9}"#;
        let parsed: WithdrawalRequested = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.destination_tag, Some(9));
        assert_eq!(parsed.amount, dec!(25));
    }
}
