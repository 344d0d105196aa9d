//! Withdrawal fee policy: estimate × multiplier, rounded up, then capped.

use rust_decimal::Decimal;

use crate::common::ChainConfig;
use crate::types::ceil_to_unit;

#[derive(Debug, Clone, PartialEq)]
pub struct FeePolicy {
    pub multiplier: Decimal,
    pub cap: Option<Decimal>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            multiplier: Decimal::new(15, 1),
            cap: None,
        }
    }
}

impl FeePolicy {
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            multiplier: config.fee_multiplier,
            cap: config.fee_cap,
        }
    }

    /// Fee to attach to a transaction, in units with `decimals` places
    pub fn apply(&self, estimate: Decimal, decimals: u32) -> Decimal {
        let fee = ceil_to_unit(estimate * self.multiplier, decimals);
        match self.cap {
            Some(cap) if fee > cap => cap,
            _ => fee,
        }
    }

    /// Whether a raw estimate is affordable under the cap
    pub fn within_cap(&self, estimate: Decimal) -> bool {
        self.cap.map_or(true, |cap| estimate <= cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ripple_fee_rounds_up_to_drops() {
        let policy = FeePolicy::default();
        // 11 drops * 1.5 = 16.5 -> 17 drops
        assert_eq!(policy.apply(dec!(0.000011), 6), dec!(0.000017));
        assert_eq!(policy.apply(dec!(0.000012), 6), dec!(0.000018));
    }

    #[test]
    fn test_cap_is_used_when_estimate_exceeds_it() {
        let policy = FeePolicy {
            multiplier: dec!(1.5),
            cap: Some(dec!(0.001)),
        };
        assert_eq!(policy.apply(dec!(0.01), 8), dec!(0.001));
        assert_eq!(policy.apply(dec!(0.0002), 8), dec!(0.0003));
        assert!(!policy.within_cap(dec!(0.002)));
    }
}
