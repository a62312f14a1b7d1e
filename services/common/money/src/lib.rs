use bigdecimal::{BigDecimal, ToPrimitive};
use thiserror::Error;

/// Decimal places carried by a major-unit amount (rupees, dollars).
pub const MINOR_UNIT_SCALE: i64 = 2;

const MINOR_UNITS_PER_MAJOR: i64 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount must not be negative: {0}")]
    Negative(String),
    #[error("amount does not fit in minor units: {0}")]
    OutOfRange(String),
}

/// Normalize a monetary value to 2 decimal places, rounding half away from zero.
pub fn normalize_scale(value: &BigDecimal) -> BigDecimal {
    let truncated = value.with_scale(MINOR_UNIT_SCALE);
    let remainder = value - &truncated;
    let half_step = BigDecimal::from(5) / BigDecimal::from(1000);
    let step = BigDecimal::from(1) / BigDecimal::from(MINOR_UNITS_PER_MAJOR);
    let negative_half_step = -half_step.clone();

    let rounded = if remainder >= half_step {
        truncated + step
    } else if remainder <= negative_half_step {
        truncated - step
    } else {
        truncated
    };
    rounded.with_scale(MINOR_UNIT_SCALE)
}

/// Convert a major-unit amount into integer minor units (paise, cents) after normalization.
pub fn to_minor_units(value: &BigDecimal) -> Result<i64, MoneyError> {
    if *value < BigDecimal::from(0) {
        return Err(MoneyError::Negative(value.to_string()));
    }
    let scaled = normalize_scale(value) * BigDecimal::from(MINOR_UNITS_PER_MAJOR);
    scaled
        .with_scale(0)
        .to_i64()
        .ok_or_else(|| MoneyError::OutOfRange(value.to_string()))
}

/// Convert integer minor units reported by a gateway back into a major-unit decimal.
pub fn from_minor_units(minor: i64) -> BigDecimal {
    (BigDecimal::from(minor) / BigDecimal::from(MINOR_UNITS_PER_MAJOR)).with_scale(MINOR_UNIT_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal { BigDecimal::from_str(s).unwrap() }

    #[test]
    fn normalize_rounds_half_up() {
        assert_eq!(normalize_scale(&dec("12.3456")).to_string(), "12.35");
        assert_eq!(normalize_scale(&dec("12.344")).to_string(), "12.34");
        assert_eq!(normalize_scale(&dec("1.005")).to_string(), "1.01");
        assert_eq!(normalize_scale(&dec("-1.005")).to_string(), "-1.01");
        assert_eq!(normalize_scale(&dec("7")).to_string(), "7.00");
    }

    #[test]
    fn minor_units_conversion() {
        assert_eq!(to_minor_units(&dec("499.00")).unwrap(), 49_900);
        assert_eq!(to_minor_units(&dec("0.015")).unwrap(), 2);
        assert_eq!(from_minor_units(49_900).to_string(), "499.00");
        assert_eq!(from_minor_units(5).to_string(), "0.05");
    }

    #[test]
    fn negative_amount_rejected() {
        let err = to_minor_units(&dec("-0.01")).unwrap_err();
        assert!(matches!(err, MoneyError::Negative(_)));
    }
}
