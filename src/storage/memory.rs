//! In-Memory Storage Implementations
//!
//! For tests and local runs. Data is lost when the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::traits::{DepositStore, StorageError, StorageResult, WalletStore, WithdrawalStore};
use crate::types::{
    DepositTransaction, Network, Wallet, WithdrawalStatus, WithdrawalTransaction,
};

/// Thread-safe in-memory store for every record type
#[derive(Clone, Default)]
pub struct MemoryStore {
    deposits: Arc<RwLock<HashMap<String, DepositTransaction>>>,
    /// Index: `(network, external_id)` -> deposit id
    by_external_id: Arc<RwLock<HashMap<(Network, String), String>>>,
    withdrawals: Arc<RwLock<HashMap<String, WithdrawalTransaction>>>,
    wallets: Arc<RwLock<HashMap<String, Wallet>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn count_statuses<S: ToString>(statuses: impl Iterator<Item = S>) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for status in statuses {
        *counts.entry(status.to_string()).or_insert(0) += 1;
    }
    counts
}

#[async_trait]
impl DepositStore for MemoryStore {
    async fn insert(&self, record: &DepositTransaction) -> StorageResult<()> {
        let mut deposits = self.deposits.write().await;
        let mut index = self.by_external_id.write().await;

        let key = (record.network, record.external_id.clone());
        if index.contains_key(&key) {
            return Err(StorageError::Duplicate(format!(
                "{}:{}",
                record.network, record.external_id
            )));
        }
        if deposits.contains_key(&record.id) {
            return Err(StorageError::Duplicate(record.id.clone()));
        }

        index.insert(key, record.id.clone());
        deposits.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &DepositTransaction) -> StorageResult<()> {
        let mut deposits = self.deposits.write().await;
        match deposits.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(record.id.clone())),
        }
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<DepositTransaction>> {
        Ok(self.deposits.read().await.get(id).cloned())
    }

    async fn get_by_external_id(
        &self,
        network: Network,
        external_id: &str,
    ) -> StorageResult<Option<DepositTransaction>> {
        let id = match self
            .by_external_id
            .read()
            .await
            .get(&(network, external_id.to_string()))
        {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        Ok(self.deposits.read().await.get(&id).cloned())
    }

    async fn get_active(&self, network: Option<Network>) -> StorageResult<Vec<DepositTransaction>> {
        let deposits = self.deposits.read().await;
        let mut active: Vec<_> = deposits
            .values()
            .filter(|d| !d.status.is_terminal())
            .filter(|d| network.map_or(true, |n| d.network == n))
            .cloned()
            .collect();
        active.sort_by_key(|d| d.created_at);
        Ok(active)
    }

    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>> {
        let deposits = self.deposits.read().await;
        Ok(count_statuses(deposits.values().map(|d| d.status)))
    }
}

#[async_trait]
impl WithdrawalStore for MemoryStore {
    async fn insert(&self, record: &WithdrawalTransaction) -> StorageResult<()> {
        let mut withdrawals = self.withdrawals.write().await;
        if withdrawals.contains_key(&record.id) {
            return Err(StorageError::Duplicate(record.id.clone()));
        }
        withdrawals.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &WithdrawalTransaction) -> StorageResult<()> {
        let mut withdrawals = self.withdrawals.write().await;
        match withdrawals.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(record.id.clone())),
        }
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<WithdrawalTransaction>> {
        Ok(self.withdrawals.read().await.get(id).cloned())
    }

    async fn get_by_status(&self, status: WithdrawalStatus) -> StorageResult<Vec<WithdrawalTransaction>> {
        let withdrawals = self.withdrawals.read().await;
        let mut matching: Vec<_> = withdrawals
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|w| w.created_at);
        Ok(matching)
    }

    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>> {
        let withdrawals = self.withdrawals.read().await;
        Ok(count_statuses(withdrawals.values().map(|w| w.status)))
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn insert(&self, wallet: &Wallet) -> StorageResult<()> {
        let mut wallets = self.wallets.write().await;

        let clash = wallets.values().any(|w| {
            w.network == wallet.network
                && (w.user_id == wallet.user_id
                    || (w.address == wallet.address && w.destination_tag == wallet.destination_tag))
        });
        if clash || wallets.contains_key(&wallet.wallet_id) {
            return Err(StorageError::Duplicate(format!(
                "{}:{}",
                wallet.network, wallet.user_id
            )));
        }

        wallets.insert(wallet.wallet_id.clone(), wallet.clone());
        Ok(())
    }

    async fn get_for_user(&self, user_id: &str, network: Network) -> StorageResult<Option<Wallet>> {
        let wallets = self.wallets.read().await;
        Ok(wallets
            .values()
            .find(|w| w.user_id == user_id && w.network == network)
            .cloned())
    }

    async fn find_owner(
        &self,
        network: Network,
        address: &str,
        destination_tag: Option<u32>,
    ) -> StorageResult<Option<Wallet>> {
        let wallets = self.wallets.read().await;
        Ok(wallets
            .values()
            .find(|w| {
                w.network == network && w.address == address && w.destination_tag == destination_tag
            })
            .cloned())
    }

    async fn list_by_network(&self, network: Network) -> StorageResult<Vec<Wallet>> {
        let wallets = self.wallets.read().await;
        let mut matching: Vec<_> = wallets.values().filter(|w| w.network == network).cloned().collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.wallet_id.cmp(&b.wallet_id)));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_duplicate_external_id() {
        let store = MemoryStore::new();
        let first = DepositTransaction::new(
            "u1".to_string(),
            Network::Trx,
            "hash".to_string(),
            "T_addr".to_string(),
            dec!(10),
        );
        let second = DepositTransaction::new(
            "u1".to_string(),
            Network::Trx,
            "hash".to_string(),
            "T_addr".to_string(),
            dec!(10),
        );

        DepositStore::insert(&store, &first).await.unwrap();
        assert!(matches!(
            DepositStore::insert(&store, &second).await,
            Err(StorageError::Duplicate(_))
        ));

        let found = store.get_by_external_id(Network::Trx, "hash").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = MemoryStore::new();
        let record = DepositTransaction::new(
            "u1".to_string(),
            Network::Btc,
            "tx".to_string(),
            "bc1q".to_string(),
            dec!(0.1),
        );
        assert!(matches!(
            DepositStore::update(&store, &record).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wallet_owner_lookup() {
        let store = MemoryStore::new();
        let wallet = Wallet::new("w1".to_string(), "u1".to_string(), Network::Eth, "0xabc".to_string(), None);
        WalletStore::insert(&store, &wallet).await.unwrap();

        let owner = store.find_owner(Network::Eth, "0xabc", None).await.unwrap();
        assert_eq!(owner, Some(wallet));
        assert!(store.find_owner(Network::Erc20, "0xabc", None).await.unwrap().is_none());
    }
}
