//! Pooling (sweep) results.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Network;

/// What happened to one wallet during a sweep pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PoolingOutcome {
    Swept {
        tx_hash: String,
        amount: Decimal,
        fee: Decimal,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingEntry {
    pub wallet_id: String,
    pub address: String,
    #[serde(flatten)]
    pub outcome: PoolingOutcome,
}

/// One sweep pass over a network. Only logged and published, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingRecord {
    pub network: Network,
    pub hot_wallet: String,
    pub started_at: u64,
    pub entries: Vec<PoolingEntry>,
}

impl PoolingRecord {
    pub fn swept_total(&self) -> Decimal {
        self.entries
            .iter()
            .filter_map(|e| match &e.outcome {
                PoolingOutcome::Swept { amount, .. } => Some(*amount),
                _ => None,
            })
            .sum()
    }

    pub fn count(&self, pred: impl Fn(&PoolingOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

impl std::fmt::Display for PoolingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pooling {}: {} swept | {} skipped | {} failed | total {}",
            self.network,
            self.count(|o| matches!(o, PoolingOutcome::Swept { .. })),
            self.count(|o| matches!(o, PoolingOutcome::Skipped { .. })),
            self.count(|o| matches!(o, PoolingOutcome::Failed { .. })),
            self.swept_total()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_summary() {
        let record = PoolingRecord {
            network: Network::Eth,
            hot_wallet: "0xhot".to_string(),
            started_at: 0,
            entries: vec![
                PoolingEntry {
                    wallet_id: "w1".to_string(),
                    address: "0x1".to_string(),
                    outcome: PoolingOutcome::Swept {
                        tx_hash: "0xt".to_string(),
                        amount: dec!(1.5),
                        fee: dec!(0.001),
                    },
                },
                PoolingEntry {
                    wallet_id: "w2".to_string(),
                    address: "0x2".to_string(),
                    outcome: PoolingOutcome::Skipped {
                        reason: "below minimum".to_string(),
                    },
                },
            ],
        };

        assert_eq!(record.swept_total(), dec!(1.5));
        assert!(record.to_string().contains("1 swept | 1 skipped | 0 failed"));

        let json = serde_json::to_value(&record.entries[1]).unwrap();
        assert_eq!(json["outcome"], "skipped");
    }
}
