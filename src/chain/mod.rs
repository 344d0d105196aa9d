//! Chain Clients
//!
//! One [`ChainClient`] per network hides the provider differences: custodial
//! REST for the UTXO chains, JSON-RPC for EVM, the Tron HTTP API and the
//! Ripple JSON API. Every client normalizes finality into a [`Receipt`].

pub mod custodial;
pub mod evm;
pub mod fee;
pub mod receipt;
pub mod registry;
pub mod ripple;
pub mod rpc;
pub mod signer;
pub mod tron;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::ErrorKind;
use crate::types::Network;

pub use custodial::CustodialClient;
pub use evm::EvmClient;
pub use fee::FeePolicy;
pub use receipt::{calculate_confirmations, Depth, Receipt, ReceiptStatus};
pub use registry::ChainRegistry;
pub use ripple::RippleClient;
pub use rpc::RpcClient;
pub use signer::{RemoteSigner, SignedTx, Signer};
pub use tron::TronClient;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Transport(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider error ({status}): {body}")]
    Server { status: u16, body: String },

    /// The node or signer definitely refused the transaction
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("unexpected provider response: {0}")]
    Parse(String),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Timeout
            | ChainError::Transport(_)
            | ChainError::RateLimited
            | ChainError::Server { .. }
            | ChainError::Parse(_) => ErrorKind::Transient,
            ChainError::Rejected(_) | ChainError::InvalidAddress(_) | ChainError::Unsupported(_) => {
                ErrorKind::Validation
            }
            ChainError::Reverted(_) => ErrorKind::Reversion,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// True when the transaction is known not to have reached the network
    pub fn is_definite_rejection(&self) -> bool {
        matches!(self, ChainError::Rejected(_) | ChainError::InvalidAddress(_))
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout
        } else if e.status().map_or(false, |s| s.as_u16() == 429) {
            ChainError::RateLimited
        } else if e.is_decode() {
            ChainError::Parse(e.to_string())
        } else {
            ChainError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeePriority {
    Low,
    Normal,
    High,
}

/// Wallet that pays for an outbound transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceWallet {
    /// Id the signer knows the key by
    pub wallet_id: String,
    pub address: String,
}

/// A transfer ready to be signed
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundTx {
    pub network: Network,
    pub source: SourceWallet,
    pub destination: String,
    pub destination_tag: Option<u32>,
    pub amount: Decimal,
    /// Maximum fee the transaction may spend, already rounded and capped
    pub fee: Decimal,
    /// Caller reference, passed to providers that deduplicate sends
    pub reference: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn network(&self) -> Network;

    /// Decimal places of the currency fees are paid in
    fn fee_decimals(&self) -> u32 {
        self.network().native_decimals()
    }

    async fn get_current_height(&self) -> Result<u64, ChainError>;

    /// `None` while the transaction is unknown to the network
    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError>;

    async fn estimate_fee(&self, priority: FeePriority) -> Result<Decimal, ChainError>;

    async fn derive_address(&self, wallet_id: &str) -> Result<String, ChainError>;

    /// Sign and submit; returns the transaction hash
    async fn sign_and_broadcast(&self, tx: &OutboundTx) -> Result<String, ChainError>;

    async fn get_balance(&self, address: &str) -> Result<Decimal, ChainError>;

    fn validate_address(&self, address: &str) -> Result<(), ChainError>;
}

/// Characters outside the base58 alphabet: `0`, `O`, `I` and `l`
pub(crate) fn is_base58(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ChainError::Timeout.is_retryable());
        assert!(ChainError::Server { status: 502, body: String::new() }.is_retryable());
        assert_eq!(ChainError::Reverted("0x0".into()).kind(), ErrorKind::Reversion);
        assert!(ChainError::Rejected("nonce too low".into()).is_definite_rejection());
        assert!(!ChainError::Timeout.is_definite_rejection());
    }

    #[test]
    fn test_base58_alphabet() {
        assert!(is_base58("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
        assert!(!is_base58("0OIl"));
        assert!(!is_base58(""));
    }
}
