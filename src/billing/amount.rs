use super::error::{BillingError, BillingResult};

/// Currencies the processor bills without a fractional unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

fn minor_units_per_major(currency: &str) -> i64 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str()) {
        1
    } else {
        100
    }
}

/// Converts a major-unit amount into the processor's integer minor units, rounding to the
/// nearest unit.
pub fn to_minor_units(amount: f64, currency: &str) -> BillingResult<i64> {
    if !amount.is_finite() {
        return Err(BillingError::Validation("amount must be a finite number".into()));
    }
    if amount <= 0.0 {
        return Err(BillingError::Validation("amount must be positive".into()));
    }
    let scaled = (amount * minor_units_per_major(currency) as f64).round();
    if scaled > i64::MAX as f64 {
        return Err(BillingError::Validation("amount is too large".into()));
    }
    let minor = scaled as i64;
    if minor == 0 {
        return Err(BillingError::Validation(
            "amount rounds to zero minor units".into(),
        ));
    }
    Ok(minor)
}

pub fn to_major_units(amount_minor: i64, currency: &str) -> f64 {
    amount_minor as f64 / minor_units_per_major(currency) as f64
}

pub fn normalize_currency(currency: &str) -> BillingResult<String> {
    let normalized = currency.trim().to_ascii_lowercase();
    if normalized.len() != 3 || !normalized.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(BillingError::Validation(format!(
            "`{currency}` is not an ISO 4217 currency code"
        )));
    }
    Ok(normalized)
}
