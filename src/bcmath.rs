//! Decimal string arithmetic
//!
//! Exact base-10 math on price/volume strings. Every operation rounds its
//! result half-to-even at the requested number of fractional digits and
//! renders exactly that many digits, so "10" at precision 4 is "10.0000".

use rust_decimal::prelude::*;
use rust_decimal::MathematicalOps;
use std::cmp::Ordering;
use thiserror::Error;

/// Errors produced by decimal string arithmetic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecimalError {
    #[error("invalid decimal literal: {0:?}")]
    Parse(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("decimal overflow")]
    Overflow,
}

pub type DecimalResult<T> = std::result::Result<T, DecimalError>;

/// Parse a decimal literal, accepting plain and scientific notation
pub fn parse(s: &str) -> DecimalResult<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|_| DecimalError::Parse(s.to_string()))
}

/// Round half-to-even and render with exactly `precision` fractional digits
pub fn format(value: Decimal, precision: u32) -> String {
    let mut rounded =
        value.round_dp_with_strategy(precision, RoundingStrategy::MidpointNearestEven);
    if rounded.is_zero() {
        rounded.set_sign_positive(true);
    }
    rounded.rescale(precision);
    rounded.to_string()
}

fn binary<F>(a: &str, b: &str, precision: u32, op: F) -> DecimalResult<String>
where
    F: FnOnce(Decimal, Decimal) -> DecimalResult<Decimal>,
{
    let lhs = parse(a)?;
    let rhs = parse(b)?;
    op(lhs, rhs).map(|v| format(v, precision))
}

pub fn add(a: &str, b: &str, precision: u32) -> DecimalResult<String> {
    binary(a, b, precision, |x, y| {
        x.checked_add(y).ok_or(DecimalError::Overflow)
    })
}

pub fn sub(a: &str, b: &str, precision: u32) -> DecimalResult<String> {
    binary(a, b, precision, |x, y| {
        x.checked_sub(y).ok_or(DecimalError::Overflow)
    })
}

/// |a - b|
pub fn abs_sub(a: &str, b: &str, precision: u32) -> DecimalResult<String> {
    binary(a, b, precision, |x, y| {
        x.checked_sub(y).map(|d| d.abs()).ok_or(DecimalError::Overflow)
    })
}

pub fn mul(a: &str, b: &str, precision: u32) -> DecimalResult<String> {
    binary(a, b, precision, |x, y| {
        x.checked_mul(y).ok_or(DecimalError::Overflow)
    })
}

pub fn div(a: &str, b: &str, precision: u32) -> DecimalResult<String> {
    binary(a, b, precision, |x, y| {
        if y.is_zero() {
            return Err(DecimalError::DivisionByZero);
        }
        x.checked_div(y).ok_or(DecimalError::Overflow)
    })
}

/// a ^ b. Integral exponents are exact, fractional ones go through `powd`.
pub fn pow(a: &str, b: &str, precision: u32) -> DecimalResult<String> {
    binary(a, b, precision, |x, y| {
        if y.fract().is_zero() {
            let exp = y.to_i64().ok_or(DecimalError::Overflow)?;
            x.checked_powi(exp).ok_or(DecimalError::Overflow)
        } else {
            x.checked_powd(y).ok_or(DecimalError::Overflow)
        }
    })
}

/// a mod b, sign follows the dividend
pub fn rem(a: &str, b: &str, precision: u32) -> DecimalResult<String> {
    binary(a, b, precision, |x, y| {
        if y.is_zero() {
            return Err(DecimalError::DivisionByZero);
        }
        x.checked_rem(y).ok_or(DecimalError::Overflow)
    })
}

pub fn cmp(a: &str, b: &str) -> DecimalResult<Ordering> {
    Ok(parse(a)?.cmp(&parse(b)?))
}

/// `cmp` collapsed to -1 / 0 / 1
pub fn cmp_sign(a: &str, b: &str) -> DecimalResult<i32> {
    Ok(match cmp(a, b)? {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

/// Smaller of two decimal strings, returned as given
pub fn min<'a>(a: &'a str, b: &'a str) -> DecimalResult<&'a str> {
    Ok(if cmp(a, b)? == Ordering::Greater { b } else { a })
}

/// Larger of two decimal strings, returned as given
pub fn max<'a>(a: &'a str, b: &'a str) -> DecimalResult<&'a str> {
    Ok(if cmp(a, b)? == Ordering::Less { b } else { a })
}
