//! Storage Layer Module
//!
//! Persistence for deposits, withdrawals and the wallet registry.
//!
//! - Storage trait definitions
//! - SQLite implementation for production
//! - In-memory implementation for tests

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryStore;
pub use sqlite::{SqlitePool, SqliteStore};
pub use traits::{DepositStore, StorageError, StorageResult, WalletStore, WithdrawalStore};
