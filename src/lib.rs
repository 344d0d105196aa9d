//! Payments Pipeline - Crypto Deposits and Withdrawals
//!
//! Moves funds between user balances held in the wallet ledger and
//! on-chain wallets on BTC, LTC, DOGE, ETH, ERC20, TRX and XRP.
//!
//! ## Workers
//!
//! 1. **Deposit watcher** - Observes inbound transfers and publishes `DepositDetected`
//! 2. **Deposit confirmation** - Tracks confirmations and credits the ledger exactly once
//! 3. **Withdrawal dispatcher** - Validates, debits, flags for review and broadcasts
//! 4. **Withdrawal confirmation** - Tracks outbound transactions to finality, refunds failures
//! 5. **Pooling** - Sweeps user wallets into the hot wallet
//!
//! Workers share a SQLite database for records, locks and the message bus, so
//! any number of worker processes can run side by side on one host.

pub mod alert;
pub mod api;
pub mod bus;
pub mod chain;
pub mod common;
pub mod deposit;
pub mod ledger;
pub mod lock;
pub mod pooling;
pub mod storage;
pub mod supervisor;
pub mod types;
pub mod withdrawal;

// Re-exports: ambient stack
pub use common::{ErrorKind, Health, HealthState, PaymentError, PaymentsConfig, RetryPolicy};

// Re-exports: workers
pub use deposit::{DepositConfirmer, DepositWatcher};
pub use pooling::PoolingWorker;
pub use withdrawal::{WithdrawalConfirmer, WithdrawalDispatcher};

// Re-exports: domain types
pub use types::{
    DepositStatus, DepositTransaction, Network, Wallet, WithdrawalStatus, WithdrawalTransaction,
};
