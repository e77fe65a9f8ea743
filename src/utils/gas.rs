//! Integer GAS arithmetic.
//!
//! Amounts are carried everywhere as i64 "fractions", 1 GAS = 10^8
//! fractions (Neo's GAS decimals). Decimal strings only appear at the API
//! boundary.

use crate::error::ServiceError;

pub const FRACTIONS_PER_GAS: i64 = 100_000_000;
const DECIMALS: u32 = 8;

/// Parses a non-negative decimal GAS amount ("5", "0.5", "1.23456789")
/// into fractions. More than 8 decimal places is rejected.
pub fn parse_gas(s: &str) -> Result<i64, ServiceError> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
        return Err(ServiceError::invalid(format!("invalid gas amount: {s:?}")));
    }

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(ServiceError::invalid(format!("invalid gas amount: {s:?}")));
    }
    if frac.len() > DECIMALS as usize {
        return Err(ServiceError::invalid(format!(
            "gas amount has more than {DECIMALS} decimal places: {s:?}"
        )));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServiceError::invalid(format!("invalid gas amount: {s:?}")));
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| ServiceError::invalid(format!("gas amount out of range: {s:?}")))?
    };

    let mut frac_value: i64 = 0;
    if !frac.is_empty() {
        frac_value = frac.parse().unwrap_or(0);
        frac_value *= 10_i64.pow(DECIMALS - frac.len() as u32);
    }

    whole
        .checked_mul(FRACTIONS_PER_GAS)
        .and_then(|w| w.checked_add(frac_value))
        .ok_or_else(|| ServiceError::invalid(format!("gas amount out of range: {s:?}")))
}

/// Formats fractions back into a decimal string without trailing zeros.
#[must_use]
pub fn format_gas(fractions: i64) -> String {
    let sign = if fractions < 0 { "-" } else { "" };
    let abs = fractions.unsigned_abs();
    let whole = abs / FRACTIONS_PER_GAS as u64;
    let frac = abs % FRACTIONS_PER_GAS as u64;

    if frac == 0 {
        return format!("{sign}{whole}");
    }

    let frac = format!("{frac:08}");
    let frac = frac.trim_end_matches('0');
    format!("{sign}{whole}.{frac}")
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("0" => 0)]
    #[test_case("5" => 500_000_000)]
    #[test_case("5.0" => 500_000_000)]
    #[test_case("0.5" => 50_000_000)]
    #[test_case(".5" => 50_000_000)]
    #[test_case("1.23456789" => 123_456_789)]
    #[test_case("92233720368.54775807" => i64::MAX)]
    fn parses(s: &str) -> i64 {
        parse_gas(s).unwrap()
    }

    #[test_case(""; "empty")]
    #[test_case("-1"; "negative")]
    #[test_case("+1"; "plus prefixed")]
    #[test_case("1.123456789"; "nine decimals")]
    #[test_case("abc"; "non numeric")]
    #[test_case("1.2.3"; "two dots")]
    #[test_case("92233720368.54775808"; "overflow")]
    fn rejects(s: &str) {
        assert!(parse_gas(s).is_err());
    }

    #[test]
    fn round_trips() {
        for s in ["0", "5", "0.5", "1.23456789", "42.1"] {
            assert_eq!(format_gas(parse_gas(s).unwrap()), s.trim_start_matches("+"));
        }
        assert_eq!(format_gas(-50_000_000), "-0.5");
    }
}
