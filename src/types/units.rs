//! Unit Conversion Utilities
//!
//! Helpers for moving between display amounts (`Decimal`) and on-chain
//! integer base units (satoshis, wei, sun, drops).

use rust_decimal::{Decimal, RoundingStrategy};

/// Convert a display amount into integer base units.
///
/// Returns `None` if the amount is negative, carries more precision than the
/// chain supports, or does not fit.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Option<u128> {
    if amount.is_sign_negative() {
        return None;
    }
    if amount.normalize().scale() > decimals {
        return None;
    }

    let mut scaled = amount;
    scaled.rescale(decimals);
    u128::try_from(scaled.mantissa()).ok()
}

/// Convert integer base units into a display amount
pub fn from_base_units(units: u128, decimals: u32) -> Option<Decimal> {
    let mantissa = i128::try_from(units).ok()?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .ok()
        .map(|d| d.normalize())
}

/// Parse a base-unit string such as `"1500000"` drops or a `0x` hex quantity
pub fn parse_base_units(s: &str) -> Option<u128> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex) if hex.is_empty() => Some(0),
        Some(hex) => u128::from_str_radix(hex, 16).ok(),
        None => s.replace('_', "").parse().ok(),
    }
}

/// Round an amount up to the chain's smallest unit
pub fn ceil_to_unit(amount: Decimal, decimals: u32) -> Decimal {
    amount
        .round_dp_with_strategy(decimals, RoundingStrategy::AwayFromZero)
        .normalize()
}

/// Human-readable amount, e.g. `"0.5 eth"`
pub fn format_amount(amount: Decimal, network: crate::types::Network) -> String {
    format!("{} {}", amount.normalize(), network)
}
