//! Pooling Worker
//!
//! Sweeps user deposit wallets into the network's hot wallet on a fixed
//! interval. A wallet is swept only when its balance reaches the configured
//! minimum and the fee estimate is within the cap. Failures are recorded per
//! wallet and never abort the pass.

use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::bus::{publish_message, EventBus};
use crate::chain::{ChainClient, ChainError, ChainRegistry, FeePolicy, FeePriority, OutboundTx, SourceWallet};
use crate::common::{log_pooling_event, retry_transient, ChainConfig, PaymentError, PaymentsConfig};
use crate::lock::{with_lock, LockManager, POOLING_NAMESPACE};
use crate::storage::WalletStore;
use crate::types::{now_secs, Network, PoolingEntry, PoolingOutcome, PoolingRecord, Wallet};

const PUBLISHER: &str = "pooling";

pub struct PoolingWorker {
    wallets: Arc<dyn WalletStore>,
    chains: ChainRegistry,
    locks: Arc<dyn LockManager>,
    bus: Arc<dyn EventBus>,
    config: Arc<PaymentsConfig>,
}

impl PoolingWorker {
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        chains: ChainRegistry,
        locks: Arc<dyn LockManager>,
        bus: Arc<dyn EventBus>,
        config: Arc<PaymentsConfig>,
    ) -> Self {
        Self {
            wallets,
            chains,
            locks,
            bus,
            config,
        }
    }

    /// Networks with pooling switched on
    pub fn networks(&self) -> Vec<Network> {
        self.config
            .enabled_networks()
            .filter(|n| self.config.chain(*n).map_or(false, |c| c.pooling_enabled))
            .collect()
    }

    /// One pass over every pooling network
    pub async fn run_once(&self) -> Result<Vec<PoolingRecord>, PaymentError> {
        let mut records = Vec::new();
        for network in self.networks() {
            if let Some(record) = self.sweep_network(network).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Sweep every wallet of one network. `None` when no hot wallet is configured.
    pub async fn sweep_network(&self, network: Network) -> Result<Option<PoolingRecord>, PaymentError> {
        let chain = self
            .config
            .chain(network)
            .map_err(|e| PaymentError::validation(e.to_string()))?;
        let Some(hot_wallet) = chain.hot_wallet_address.clone() else {
            tracing::warn!(target: "payments::pooling", %network, "no hot wallet configured, skipping");
            return Ok(None);
        };

        let started = Instant::now();
        let client = self.chains.get(network)?;
        let wallets = self.wallets.list_by_network(network).await?;

        let mut record = PoolingRecord {
            network,
            hot_wallet: hot_wallet.clone(),
            started_at: now_secs(),
            entries: Vec::with_capacity(wallets.len()),
        };

        for wallet in wallets.into_iter().filter(|w| w.address != hot_wallet) {
            let outcome = with_lock(
                self.locks.as_ref(),
                POOLING_NAMESPACE,
                &wallet.address,
                self.config.pooling_lock_ttl,
                || async { Ok(self.sweep_wallet(client.as_ref(), chain, &hot_wallet, &wallet).await) },
            )
            .await?
            .unwrap_or_else(|| PoolingOutcome::Skipped {
                reason: "locked by another worker".to_string(),
            });

            if let PoolingOutcome::Failed { error } = &outcome {
                tracing::warn!(
                    target: "payments::pooling",
                    %network,
                    wallet_id = %wallet.wallet_id,
                    error = %error,
                    "sweep failed"
                );
            }
            record.entries.push(PoolingEntry {
                wallet_id: wallet.wallet_id,
                address: wallet.address,
                outcome,
            });
        }

        retry_transient(&self.config.retry, "publish PoolingCompleted", || {
            publish_message(self.bus.as_ref(), &record, PUBLISHER)
        })
        .await?;
        log_pooling_event(&record, started.elapsed().as_millis() as u64);
        Ok(Some(record))
    }

    async fn sweep_wallet(
        &self,
        client: &dyn ChainClient,
        chain: &ChainConfig,
        hot_wallet: &str,
        wallet: &Wallet,
    ) -> PoolingOutcome {
        match self.try_sweep(client, chain, hot_wallet, wallet).await {
            Ok(outcome) => outcome,
            Err(e) => PoolingOutcome::Failed { error: e.to_string() },
        }
    }

    async fn try_sweep(
        &self,
        client: &dyn ChainClient,
        chain: &ChainConfig,
        hot_wallet: &str,
        wallet: &Wallet,
    ) -> Result<PoolingOutcome, ChainError> {
        let policy = &self.config.retry;

        let balance = retry_transient(policy, "get_balance", || client.get_balance(&wallet.address)).await?;
        if balance.is_zero() || balance < chain.pooling_min_balance {
            return Ok(PoolingOutcome::Skipped {
                reason: format!("balance {} below minimum {}", balance, chain.pooling_min_balance),
            });
        }

        let estimate = retry_transient(policy, "estimate_fee", || client.estimate_fee(FeePriority::Low)).await?;
        let fees = FeePolicy::from_config(chain);
        if !fees.within_cap(estimate) {
            return Ok(PoolingOutcome::Skipped {
                reason: format!("fee estimate {} above cap", estimate),
            });
        }
        let fee = fees.apply(estimate, client.fee_decimals());

        // Token sweeps pay gas in the native coin; native sweeps pay it out of the balance
        let amount = if chain.network == Network::Erc20 {
            balance
        } else {
            balance - fee
        };
        if amount <= Decimal::ZERO {
            return Ok(PoolingOutcome::Skipped {
                reason: format!("balance {} does not cover fee {}", balance, fee),
            });
        }

        let tx = OutboundTx {
            network: chain.network,
            source: SourceWallet {
                wallet_id: wallet.wallet_id.clone(),
                address: wallet.address.clone(),
            },
            destination: hot_wallet.to_string(),
            destination_tag: None,
            amount,
            fee,
            reference: format!("pool:{}:{}", wallet.wallet_id, now_secs()),
        };
        let tx_hash = client.sign_and_broadcast(&tx).await?;

        tracing::info!(
            target: "payments::pooling",
            network = %chain.network,
            wallet_id = %wallet.wallet_id,
            %amount,
            %fee,
            %tx_hash,
            "wallet swept"
        );
        Ok(PoolingOutcome::Swept { tx_hash, amount, fee })
    }

    /// Sweep on the configured interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PaymentError> {
        let mut ticker = tokio::time::interval(self.config.pooling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let records = self.run_once().await?;
            tracing::debug!(target: "payments::pooling", networks = records.len(), "pooling pass finished");
        }
    }
}
