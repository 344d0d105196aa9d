//! Storage Trait Definitions
//!
//! Abstract persistence for deposits, withdrawals and wallets.
//! Implementations use SQLite (production) or memory (tests).

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::ErrorKind;
use crate::types::{DepositTransaction, Network, Wallet, WithdrawalStatus, WithdrawalTransaction};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Duplicate(_) => ErrorKind::Duplicate,
            StorageError::NotFound(_) => ErrorKind::Validation,
            StorageError::Database(_) | StorageError::Connection(_) => ErrorKind::Transient,
            StorageError::InvalidData(_) => ErrorKind::Fatal,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Deposit persistence. `(network, external_id)` is unique.
#[async_trait]
pub trait DepositStore: Send + Sync {
    /// Insert a new deposit; `Duplicate` if the transaction is already known
    async fn insert(&self, record: &DepositTransaction) -> StorageResult<()>;

    async fn update(&self, record: &DepositTransaction) -> StorageResult<()>;

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<DepositTransaction>>;

    async fn get_by_external_id(
        &self,
        network: Network,
        external_id: &str,
    ) -> StorageResult<Option<DepositTransaction>>;

    /// Deposits still waiting for finality, oldest first
    async fn get_active(&self, network: Option<Network>) -> StorageResult<Vec<DepositTransaction>>;

    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>>;
}

/// Withdrawal persistence. `id` is the producer's request id.
#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    async fn insert(&self, record: &WithdrawalTransaction) -> StorageResult<()>;

    async fn update(&self, record: &WithdrawalTransaction) -> StorageResult<()>;

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<WithdrawalTransaction>>;

    async fn get_by_status(&self, status: WithdrawalStatus) -> StorageResult<Vec<WithdrawalTransaction>>;

    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>>;
}

/// Wallet registry. One wallet per `(user, network)`, addresses unique per network.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn insert(&self, wallet: &Wallet) -> StorageResult<()>;

    async fn get_for_user(&self, user_id: &str, network: Network) -> StorageResult<Option<Wallet>>;

    /// Resolve an inbound address, and destination tag where the network uses one
    async fn find_owner(
        &self,
        network: Network,
        address: &str,
        destination_tag: Option<u32>,
    ) -> StorageResult<Option<Wallet>>;

    async fn list_by_network(&self, network: Network) -> StorageResult<Vec<Wallet>>;
}
