//! Fixed-point money arithmetic
//!
//! Amounts are unscaled base-unit integers (up to 78 decimal digits);
//! prices carry 18 fractional digits at the same width. All division
//! truncates toward zero; intermediate products widen to 512 bits so the
//! weighted-average math cannot overflow.

use ethers::types::{U256, U512};

use crate::error::{OrchestratorError, Result};

/// Number of fractional digits carried by price values
pub const PRICE_DECIMALS: u32 = 18;

/// Scale factor for price values: 10^18
pub const PRICE_SCALE: U256 = U256([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Slippage between an expected and an actual price, in basis points.
///
/// `floor(|expected - actual| * 10000 / expected)`; zero when the expected
/// price is zero.
pub fn slippage_bps(expected: U256, actual: U256) -> u32 {
    if expected.is_zero() {
        return 0;
    }
    let diff = if expected >= actual {
        expected - actual
    } else {
        actual - expected
    };
    let bps = diff.full_mul(U256::from(10_000u64)) / U512::from(expected);
    // Deviations beyond 2^32 bps are nonsensical; clamp rather than wrap.
    if bps > U512::from(u32::MAX) {
        u32::MAX
    } else {
        bps.as_u32()
    }
}

/// Amount-weighted mean of two price legs:
/// `(price_a * amount_a + price_b * amount_b) / (amount_a + amount_b)`.
///
/// Returns zero when both amounts are zero.
pub fn weighted_price(price_a: U256, amount_a: U256, price_b: U256, amount_b: U256) -> U256 {
    let total = amount_a + amount_b;
    if total.is_zero() {
        return U256::zero();
    }
    let value = price_a.full_mul(amount_a) + price_b.full_mul(amount_b);
    u512_to_u256(value / U512::from(total))
}

/// Parse a decimal string ("2000", "2000.53") into fixed-point base units
/// with the given number of fractional digits. Lexical only; no floats.
pub fn parse_fixed(s: &str, decimals: u32) -> Result<U256> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') {
        return Err(OrchestratorError::Validation(format!(
            "invalid decimal amount: {:?}",
            s
        )));
    }

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };

    if frac_part.len() as u32 > decimals {
        return Err(OrchestratorError::Validation(format!(
            "too many fractional digits in {:?} (max {})",
            s, decimals
        )));
    }

    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let integral = U256::from_dec_str(int_part)
        .map_err(|e| OrchestratorError::Validation(format!("invalid amount {:?}: {}", s, e)))?;

    let mut value = integral
        .checked_mul(U256::exp10(decimals as usize))
        .ok_or_else(|| OrchestratorError::Validation(format!("amount overflow: {:?}", s)))?;

    if !frac_part.is_empty() {
        let frac = U256::from_dec_str(frac_part)
            .map_err(|e| OrchestratorError::Validation(format!("invalid amount {:?}: {}", s, e)))?;
        let pad = U256::exp10((decimals - frac_part.len() as u32) as usize);
        value += frac * pad;
    }

    Ok(value)
}

fn u512_to_u256(v: U512) -> U256 {
    let mut buf = [0u8; 64];
    v.to_big_endian(&mut buf);
    U256::from_big_endian(&buf[32..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(n: u64) -> U256 {
        U256::from(n) * PRICE_SCALE
    }

    #[test]
    fn slippage_is_floor_of_relative_deviation() {
        // 2000 -> 2020 is exactly 100 bps
        assert_eq!(slippage_bps(px(2000), px(2020)), 100);
        // symmetric
        assert_eq!(slippage_bps(px(2000), px(1980)), 100);
        // truncation toward zero: 2000 -> 2001 is 5 bps
        assert_eq!(slippage_bps(px(2000), px(2001)), 5);
        assert_eq!(slippage_bps(U256::zero(), px(2000)), 0);
        assert_eq!(slippage_bps(px(2000), px(2000)), 0);
    }

    #[test]
    fn weighted_price_blends_by_amount() {
        let avg = weighted_price(px(2000), U256::from(750u64), px(2100), U256::from(250u64));
        assert_eq!(avg, px(2025));
        assert_eq!(
            weighted_price(U256::zero(), U256::zero(), U256::zero(), U256::zero()),
            U256::zero()
        );
    }

    #[test]
    fn weighted_price_survives_wide_operands() {
        // Near the 78-digit ceiling the intermediate product needs 512 bits.
        let big = U256::MAX / U256::from(4u64);
        let avg = weighted_price(px(3000), big, px(1000), big);
        assert_eq!(avg, px(2000));
    }

    #[test]
    fn parse_fixed_handles_fractions() {
        assert_eq!(parse_fixed("2000", 18).unwrap(), px(2000));
        assert_eq!(
            parse_fixed("2000.5", 18).unwrap(),
            px(2000) + U256::exp10(17) * 5
        );
        assert_eq!(parse_fixed("0.0000001", 7).unwrap(), U256::from(1u64));
        assert!(parse_fixed("-1", 18).is_err());
        assert!(parse_fixed("1.1234567890123456789", 18).is_err());
        assert!(parse_fixed("", 18).is_err());
    }
}
