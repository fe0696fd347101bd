//! Amount formatting for presentation layers.

use alloy_primitives::utils::{format_units, parse_units, ParseUnits, UnitsError};
use alloy_primitives::U256;
use thiserror::Error;

/// Native asset decimals.
pub const DECIMALS: u8 = 18;

#[derive(Debug, Error)]
pub enum AmountError {
    #[error("Invalid amount: {0}")]
    Invalid(#[from] UnitsError),

    #[error("Amount must not be negative")]
    Negative,
}

/// `1500000000000000000` -> `"1.5"`
pub fn format_amount(value: U256) -> String {
    let full = match format_units(value, DECIMALS) {
        Ok(s) => s,
        Err(_) => return value.to_string(),
    };
    match full.split_once('.') {
        Some((whole, frac)) => {
            let frac = frac.trim_end_matches('0');
            if frac.is_empty() {
                whole.to_string()
            } else {
                format!("{whole}.{frac}")
            }
        }
        None => full,
    }
}

/// `"0.5"` -> `500000000000000000`
pub fn parse_amount(raw: &str) -> Result<U256, AmountError> {
    match parse_units(raw.trim(), DECIMALS)? {
        ParseUnits::U256(value) => Ok(value),
        ParseUnits::I256(_) => Err(AmountError::Negative),
    }
}
