//! Exact token-amount arithmetic.
//!
//! Amounts travel as arbitrary-precision decimals ([`BigDecimal`]) inside
//! the service and the database, and as 256-bit unsigned integers of base
//! units (18 fractional digits) at the EVM boundary. Binary floating point
//! is never used in the money path.

use crate::error::Error;
use alloy::primitives::U256;
use bigdecimal::num_bigint::{BigInt, Sign};
use bigdecimal::BigDecimal;
use std::str::FromStr;

/// Fractional digits carried by both tokens.
pub const TOKEN_DECIMALS: i64 = 18;

/// Convert a decimal token amount to EVM base units.
///
/// Rejects negative amounts and amounts with more than 18 fractional
/// digits; never rounds.
pub fn to_base_units(amount: &BigDecimal) -> Result<U256, Error> {
    if amount.sign() == Sign::Minus {
        return Err(Error::invalid_input("amount must not be negative"));
    }
    let (int, exponent) = amount.normalized().as_bigint_and_exponent();
    if exponent > TOKEN_DECIMALS {
        return Err(Error::invalid_input(format!(
            "amount has more than {TOKEN_DECIMALS} fractional digits"
        )));
    }
    // Exact scaling by 10^(18 - exponent): append zeros to the digit string.
    let mut digits = int.to_str_radix(10);
    for _ in 0..(TOKEN_DECIMALS - exponent) {
        digits.push('0');
    }
    U256::from_str_radix(&digits, 10)
        .map_err(|e| Error::invalid_input(format!("amount exceeds 256 bits: {e}")))
}

/// Convert EVM base units to a decimal token amount (scale 18).
pub fn from_base_units(units: U256) -> BigDecimal {
    let int = BigInt::from_str(&units.to_string())
        .expect("U256 decimal rendering is always a valid integer");
    BigDecimal::new(int, TOKEN_DECIMALS)
}

/// Render an amount with exactly 18 fractional digits, the ledger's numeric
/// encoding.
pub fn format_units(amount: &BigDecimal) -> String {
    amount.with_scale(TOKEN_DECIMALS).to_string()
}

/// Parse a non-negative decimal amount string.
pub fn parse_units(s: &str) -> Result<BigDecimal, Error> {
    let amount = BigDecimal::from_str(s)
        .map_err(|e| Error::invalid_input(format!("invalid decimal amount {s:?}: {e}")))?;
    if amount.sign() == Sign::Minus {
        return Err(Error::invalid_input("amount must not be negative"));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_amount_round_trip() {
        let fifty = parse_units("50").unwrap();
        let units = to_base_units(&fifty).unwrap();
        assert_eq!(units, U256::from_str_radix("50000000000000000000", 10).unwrap());
        assert_eq!(from_base_units(units), fifty.with_scale(18));
    }

    #[test]
    fn fractional_amount_is_exact() {
        let amount = parse_units("0.000000000000000001").unwrap();
        assert_eq!(to_base_units(&amount).unwrap(), U256::from(1u64));
    }

    #[test]
    fn too_many_fractional_digits_rejected() {
        let amount = parse_units("1.0000000000000000001").unwrap();
        assert!(to_base_units(&amount).is_err());
    }

    #[test]
    fn negative_rejected() {
        assert!(parse_units("-3").is_err());
    }

    #[test]
    fn ledger_rendering_pads_to_scale_18() {
        let amount = parse_units("50").unwrap();
        assert_eq!(format_units(&amount), "50.000000000000000000");
    }

    #[test]
    fn zero_round_trip() {
        assert_eq!(to_base_units(&parse_units("0").unwrap()).unwrap(), U256::ZERO);
        assert_eq!(format_units(&from_base_units(U256::ZERO)), "0.000000000000000000");
    }
}
