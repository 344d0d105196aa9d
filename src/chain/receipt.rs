//! Normalized transaction receipts.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    /// Mined but failed on-chain; terminal
    Reverted,
}

/// How far along finality the transaction is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    /// Provider reports a confirmation count directly
    Reported(u32),
    /// Included at `block_number`; depth comes from the current height
    Included,
    /// Ledger-validated networks: final or not
    Validated(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub status: ReceiptStatus,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub depth: Depth,
}

impl Receipt {
    pub fn is_reverted(&self) -> bool {
        self.status == ReceiptStatus::Reverted
    }

    /// Whether `confirmations` needs the chain height
    pub fn needs_height(&self) -> bool {
        self.depth == Depth::Included
    }

    /// Confirmation count given the chain height and the last known count
    pub fn confirmations(&self, current_height: u64, existing: u32) -> u32 {
        match self.depth {
            Depth::Reported(n) => n,
            Depth::Included => calculate_confirmations(current_height, self.block_number, existing),
            Depth::Validated(true) => existing.max(1),
            Depth::Validated(false) => existing,
        }
    }
}

/// Depth of a transaction included at `block_number`.
///
/// With no block number the previous count is kept unchanged.
pub fn calculate_confirmations(current_height: u64, block_number: Option<u64>, existing: u32) -> u32 {
    match block_number {
        Some(block) => u32::try_from(current_height.saturating_sub(block)).unwrap_or(u32::MAX),
        None => existing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(depth: Depth, block_number: Option<u64>) -> Receipt {
        Receipt {
            tx_hash: "abc".to_string(),
            status: ReceiptStatus::Success,
            block_number,
            block_hash: None,
            depth,
        }
    }

    #[test]
    fn test_calculate_confirmations() {
        assert_eq!(calculate_confirmations(103, Some(100), 0), 3);
        assert_eq!(calculate_confirmations(103, None, 5), 5);
        // Node behind the receipt's block
        assert_eq!(calculate_confirmations(99, Some(100), 0), 0);
    }

    #[test]
    fn test_depth_models() {
        assert_eq!(receipt(Depth::Reported(4), None).confirmations(0, 2), 4);
        assert_eq!(receipt(Depth::Included, Some(45)).confirmations(50, 0), 5);
        assert_eq!(receipt(Depth::Validated(true), Some(7)).confirmations(0, 0), 1);
        assert_eq!(receipt(Depth::Validated(false), None).confirmations(0, 0), 0);
        assert!(receipt(Depth::Included, None).needs_height());
        assert!(!receipt(Depth::Validated(true), None).needs_height());
    }
}
