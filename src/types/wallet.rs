//! Wallet registry entries.

use serde::{Deserialize, Serialize};

use super::{now_secs, Network};

/// A per-user receiving wallet, or a shared wallet plus destination tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: String,
    pub user_id: String,
    pub network: Network,
    pub address: String,
    pub destination_tag: Option<u32>,
    pub created_at: u64,
}

impl Wallet {
    pub fn new(
        wallet_id: String,
        user_id: String,
        network: Network,
        address: String,
        destination_tag: Option<u32>,
    ) -> Self {
        Self {
            wallet_id,
            user_id,
            network,
            address,
            destination_tag,
            created_at: now_secs(),
        }
    }

    /// Wallet id used when asking the signer to derive an address
    pub fn derivation_id(user_id: &str, network: Network) -> String {
        format!("{}:{}", network, user_id)
    }

    /// Destination tag for a user on a shared-address network.
    ///
    /// Tags are a stable 31-bit digest of the user id.
    pub fn tag_for_user(user_id: &str) -> u32 {
        // FNV-1a
        let mut hash: u32 = 0x811c_9dc5;
        for byte in user_id.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash & 0x7fff_ffff
    }
}

/// Request body for `POST /wallets`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWalletRequest {
    pub user_id: String,
    pub network: Network,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_is_stable() {
        assert_eq!(Wallet::tag_for_user("user_1"), Wallet::tag_for_user("user_1"));
        assert_ne!(Wallet::tag_for_user("user_1"), Wallet::tag_for_user("user_2"));
        assert!(Wallet::tag_for_user("anything") <= 0x7fff_ffff);
    }

    #[test]
    fn test_derivation_id() {
        assert_eq!(Wallet::derivation_id("u9", Network::Trx), "trx:u9");
    }
}
