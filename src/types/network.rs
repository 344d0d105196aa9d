//! Supported Networks
//!
//! The closed set of chains the pipeline handles, and how each one reports
//! finality.

use serde::{Deserialize, Serialize};

/// A supported blockchain network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Btc,
    Ltc,
    Doge,
    Eth,
    /// ERC-20 token transfers on the Ethereum network
    #[serde(alias = "erc20-token")]
    Erc20,
    Trx,
    Xrp,
}

/// How a network expresses that a transaction is final
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityModel {
    /// The custodial provider reports confirmations directly
    ProviderConfirmations,
    /// `current_height - receipt.block_number`
    BlockDepth,
    /// Binary: the ledger holding the transaction is validated
    LedgerValidated,
}

impl Network {
    pub const ALL: [Network; 7] = [
        Network::Btc,
        Network::Ltc,
        Network::Doge,
        Network::Eth,
        Network::Erc20,
        Network::Trx,
        Network::Xrp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Btc => "btc",
            Network::Ltc => "ltc",
            Network::Doge => "doge",
            Network::Eth => "eth",
            Network::Erc20 => "erc20",
            Network::Trx => "trx",
            Network::Xrp => "xrp",
        }
    }

    /// Chain name used inside routing keys, e.g. `payments.inboundTronTransaction`
    pub fn routing_label(&self) -> &'static str {
        match self {
            Network::Btc => "Bitcoin",
            Network::Ltc => "Litecoin",
            Network::Doge => "Dogecoin",
            Network::Eth => "Ethereum",
            Network::Erc20 => "Erc20",
            Network::Trx => "Tron",
            Network::Xrp => "Ripple",
        }
    }

    pub fn finality_model(&self) -> FinalityModel {
        match self {
            Network::Btc | Network::Ltc | Network::Doge => FinalityModel::ProviderConfirmations,
            Network::Eth | Network::Erc20 | Network::Trx => FinalityModel::BlockDepth,
            Network::Xrp => FinalityModel::LedgerValidated,
        }
    }

    /// Default confirmation threshold before a deposit is treated as final
    pub fn default_required_confirmations(&self) -> u32 {
        match self {
            Network::Btc => 2,
            Network::Ltc => 6,
            Network::Doge => 6,
            Network::Eth | Network::Erc20 => 12,
            Network::Trx => 19,
            Network::Xrp => 1,
        }
    }

    /// Decimal places of the smallest on-chain unit (token networks override via config)
    pub fn native_decimals(&self) -> u32 {
        match self {
            Network::Btc | Network::Ltc | Network::Doge => 8,
            Network::Eth => 18,
            Network::Erc20 => 6,
            Network::Trx | Network::Xrp => 6,
        }
    }

    /// Whether deposits are addressed by a shared wallet plus a destination tag
    pub fn uses_destination_tag(&self) -> bool {
        matches!(self, Network::Xrp)
    }

    /// Whether per-user wallets hold funds that need sweeping into the hot wallet
    pub fn supports_pooling(&self) -> bool {
        matches!(self, Network::Eth | Network::Erc20 | Network::Trx)
    }

    pub fn is_custodial(&self) -> bool {
        matches!(self.finality_model(), FinalityModel::ProviderConfirmations)
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(Network::Btc),
            "ltc" | "litecoin" => Ok(Network::Ltc),
            "doge" | "dogecoin" => Ok(Network::Doge),
            "eth" | "ethereum" => Ok(Network::Eth),
            "erc20" | "erc20-token" => Ok(Network::Erc20),
            "trx" | "tron" => Ok(Network::Trx),
            "xrp" | "ripple" => Ok(Network::Xrp),
            _ => Err(format!("unknown network: {}", s)),
        }
    }
}
