//! Fixed decimal arithmetic policy.
//!
//! Every decimal result is limited to [`DECIMAL_MAX_PRECISION`] significant
//! digits; excess fraction digits are truncated toward zero. A result whose
//! integer part alone exceeds the limit is an overflow.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Maximum number of significant digits a decimal value may carry.
///
/// Kept two digits below the 28-digit `rust_decimal` mantissa so the last
/// kept digit is never one the backing library has already rounded.
pub const DECIMAL_MAX_PRECISION: u32 = 26;

/// Rounding applied whenever digits have to be dropped.
pub const DECIMAL_ROUNDING: RoundingStrategy = RoundingStrategy::ToZero;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecimalError {
    #[error("decimal division by zero")]
    DivisionByZero,
    #[error("decimal overflow")]
    Overflow,
    #[error("value {value} does not fit decimal({length},{scale})")]
    PrecisionExceeded {
        value: String,
        length: u32,
        scale: u32,
    },
}

fn digit_count(d: &Decimal) -> u32 {
    let mut mantissa = d.mantissa().unsigned_abs();
    let mut digits = 1;
    while mantissa >= 10 {
        mantissa /= 10;
        digits += 1;
    }
    digits
}

/// Drop fraction digits until the value fits the global precision.
pub fn limit_precision(d: Decimal) -> Result<Decimal, DecimalError> {
    let digits = digit_count(&d);
    if digits <= DECIMAL_MAX_PRECISION {
        return Ok(d);
    }
    let excess = digits - DECIMAL_MAX_PRECISION;
    if excess > d.scale() {
        return Err(DecimalError::Overflow);
    }
    Ok(d.round_dp_with_strategy(d.scale() - excess, DECIMAL_ROUNDING))
}

pub fn add(a: Decimal, b: Decimal) -> Result<Decimal, DecimalError> {
    limit_precision(a.checked_add(b).ok_or(DecimalError::Overflow)?)
}

pub fn sub(a: Decimal, b: Decimal) -> Result<Decimal, DecimalError> {
    limit_precision(a.checked_sub(b).ok_or(DecimalError::Overflow)?)
}

pub fn mul(a: Decimal, b: Decimal) -> Result<Decimal, DecimalError> {
    limit_precision(a.checked_mul(b).ok_or(DecimalError::Overflow)?)
}

pub fn div(a: Decimal, b: Decimal) -> Result<Decimal, DecimalError> {
    if b.is_zero() {
        return Err(DecimalError::DivisionByZero);
    }
    limit_precision(a.checked_div(b).ok_or(DecimalError::Overflow)?)
}

pub fn rem(a: Decimal, b: Decimal) -> Result<Decimal, DecimalError> {
    if b.is_zero() {
        return Err(DecimalError::DivisionByZero);
    }
    a.checked_rem(b).ok_or(DecimalError::Overflow)
}

/// Exact conversion through the shortest round-tripping text form.
pub fn from_f64(value: f64) -> Result<Decimal, DecimalError> {
    if !value.is_finite() {
        return Err(DecimalError::Overflow);
    }
    let text = format!("{value}");
    Decimal::from_str(&text)
        .map_err(|_| DecimalError::Overflow)
        .and_then(limit_precision)
}

/// Parse a literal or field text. Scientific notation is accepted.
pub fn parse(text: &str) -> Option<Decimal> {
    let trimmed = text.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
        .and_then(|d| limit_precision(d).ok())
}

/// Rescale a value for storage in a `decimal(length, scale)` field.
pub fn fit(d: Decimal, length: u32, scale: u32) -> Result<Decimal, DecimalError> {
    let mut scaled = d.round_dp_with_strategy(scale, DECIMAL_ROUNDING);
    if scaled.scale() < scale {
        scaled.rescale(scale);
    }
    if digit_count(&scaled) > length.max(1) {
        return Err(DecimalError::PrecisionExceeded {
            value: d.to_string(),
            length,
            scale,
        });
    }
    Ok(scaled)
}
