//! Shared Types Module
//!
//! Data types shared across the payments pipeline.

pub mod deposit;
pub mod events;
pub mod network;
pub mod pooling;
pub mod units;
pub mod wallet;
pub mod withdrawal;

// Re-exports for convenience
pub use deposit::{CancelReason, DepositStatus, DepositTransaction, TransitionError};
pub use events::{
    inbound_routing_key, outbound_confirmation_routing_key, outbound_routing_key,
    pooling_routing_key, BusMessage, DepositDetected, DepositSettled, OutboundConfirmed,
    OutboundSent, DEPOSIT_ROUTING_KEY, WITHDRAWAL_REQUEST_ROUTING_KEY,
    WITHDRAWAL_REVIEW_ROUTING_KEY,
};
pub use network::{FinalityModel, Network};
pub use pooling::{PoolingEntry, PoolingOutcome, PoolingRecord};
pub use units::{ceil_to_unit, format_amount, from_base_units, parse_base_units, to_base_units};
pub use wallet::{CreateWalletRequest, Wallet};
pub use withdrawal::{
    ReviewDecision, WithdrawalRequested, WithdrawalReview, WithdrawalStats, WithdrawalStatus,
    WithdrawalTransaction, WithdrawalTransitionError,
};

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
