//! Deposit Pipeline
//!
//! Inbound funds flow through two stages:
//! - `watcher`: turns chain activity into `DepositDetected` messages
//! - `confirmation`: tracks each transaction to finality and credits the ledger

pub mod confirmation;
pub mod feeds;
pub mod watcher;

pub use confirmation::{DepositConfirmer, DepositStats};
pub use feeds::{feeds_from_config, BlockCursor, InboundFeed, InboundTransfer, WebhookFeed, WebhookInbox};
pub use watcher::{DepositWatcher, SeenSet, WatcherStats};
