//! Fixed-point money helpers
//!
//! Every amount is truncated toward zero at the hundredths place before it is
//! persisted or displayed. Truncation happens per operation, never once at
//! the end of a series.

use crate::{config::CurrencyConfig, Error, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Decimal places kept for every amount
pub const SCALE: u32 = 2;

/// Truncate toward zero at the hundredths place
pub fn truncate(amount: Decimal) -> Decimal {
    let mut value = amount.round_dp_with_strategy(SCALE, RoundingStrategy::ToZero);
    // -0.00 and 0.00 must compare and print the same
    value.set_sign_positive(value.is_sign_positive() || value.is_zero());
    value
}

/// Parse a user-entered amount (e.g. `"12.5"`, `"$1000"`)
///
/// Negative and non-numeric input is rejected. The result is truncated.
pub fn parse_amount(text: &str, currency: &CurrencyConfig) -> Result<Decimal> {
    let mut trimmed = text.trim();
    if !currency.prefix.is_empty() {
        trimmed = trimmed.strip_prefix(currency.prefix.as_str()).unwrap_or(trimmed);
    }
    if !currency.suffix.is_empty() {
        trimmed = trimmed.strip_suffix(currency.suffix.as_str()).unwrap_or(trimmed);
    }
    let trimmed = trimmed.trim().replace(',', "");

    let value = Decimal::from_str(&trimmed)
        .map_err(|_| Error::PreconditionViolation(format!("'{}' is not an amount", text)))?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err(Error::PreconditionViolation(format!(
            "'{}' must not be negative",
            text
        )));
    }
    Ok(truncate(value))
}

/// Render an amount for display
///
/// `150.00` → `$150`, `150.50` → `$150.5`, `150.25` → `$150.25`,
/// `-3.5` → `-$3.5`.
pub fn format(amount: Decimal, currency: &CurrencyConfig) -> String {
    let mut magnitude = truncate(amount.abs());
    let negative = amount.is_sign_negative() && !magnitude.is_zero();

    magnitude.rescale(SCALE);
    let mut number = magnitude.to_string();
    if let Some(stripped) = number.strip_suffix(".00") {
        number = stripped.to_string();
    } else if number.ends_with('0') && number.contains('.') {
        number.pop();
    }

    format!(
        "{}{}{}{}",
        if negative { "-" } else { "" },
        currency.prefix,
        number,
        currency.suffix
    )
}
