//! Monetary conversions.
//!
//! Amounts are stored as integer cents. The wire carries yuan as a JSON number, and inputs may
//! arrive as integers, floats or decimal strings. Rounding to cents is half away from zero.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount")]
pub struct InvalidAmount;

/// Parses a JSON amount in yuan into cents.
///
/// # Errors
/// Returns [`InvalidAmount`] for `null`, empty or malformed strings, non-finite numbers, overflow
/// and any other JSON type.
pub fn parse_amount_cents(value: &Value) -> Result<i64, InvalidAmount> {
    match value {
        Value::String(raw) => parse_decimal_cents(raw),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                int.checked_mul(100).ok_or(InvalidAmount)
            } else if let Some(float) = number.as_f64() {
                float_to_cents(float)
            } else {
                Err(InvalidAmount)
            }
        }
        _ => Err(InvalidAmount),
    }
}

/// Parses a decimal string such as `"12.345"` into cents, rounding on the third fraction digit.
///
/// # Errors
/// Returns [`InvalidAmount`] when the string is not a plain decimal number.
pub fn parse_decimal_cents(raw: &str) -> Result<i64, InvalidAmount> {
    let mut value = raw.trim();
    let mut negative = false;
    if let Some(rest) = value.strip_prefix('-') {
        negative = true;
        value = rest.trim();
    } else if let Some(rest) = value.strip_prefix('+') {
        value = rest.trim();
    }
    if value.is_empty() {
        return Err(InvalidAmount);
    }
    let (int_part, frac_part) = value.split_once('.').unwrap_or((value, ""));
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(InvalidAmount);
    }
    let whole: i64 = int_part.parse().map_err(|_| InvalidAmount)?;
    let digits: Vec<i64> = frac_part
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(3)
        .map(|b| i64::from(b - b'0'))
        .collect();
    let mut cents = whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(digits[0] * 10 + digits[1]))
        .ok_or(InvalidAmount)?;
    if digits[2] >= 5 {
        cents = cents.checked_add(1).ok_or(InvalidAmount)?;
    }
    Ok(if negative { -cents } else { cents })
}

fn float_to_cents(amount: f64) -> Result<i64, InvalidAmount> {
    let cents = (amount * 100.0).round();
    if !cents.is_finite() || cents.abs() >= 9.0e18 {
        return Err(InvalidAmount);
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(cents as i64)
}

/// Wire representation: yuan as a float.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn cents_to_yuan(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// `cents * remain / total`, rounded half away from zero.
#[must_use]
pub fn prorate_cents(cents: i64, remain: i64, total: i64) -> i64 {
    if total == 0 {
        return 0;
    }
    let num = i128::from(cents) * i128::from(remain);
    let den = i128::from(total);
    let quot = num / den;
    let rem = num % den;
    let adjusted = if rem != 0 && rem.abs() * 2 >= den.abs() {
        if (num >= 0) == (den > 0) {
            quot + 1
        } else {
            quot - 1
        }
    } else {
        quot
    };
    i64::try_from(adjusted).unwrap_or(if adjusted > 0 { i64::MAX } else { i64::MIN })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_decimal_strings() {
        assert_eq!(parse_amount_cents(&json!("12.34")), Ok(1234));
        assert_eq!(parse_amount_cents(&json!(" 12 ")), Ok(1200));
        assert_eq!(parse_amount_cents(&json!(".5")), Ok(50));
        assert_eq!(parse_amount_cents(&json!("0.005")), Ok(1));
        assert_eq!(parse_amount_cents(&json!("0.004")), Ok(0));
        assert_eq!(parse_amount_cents(&json!("-1.255")), Ok(-126));
        assert_eq!(parse_amount_cents(&json!("+3.1")), Ok(310));
    }

    #[test]
    fn parses_numbers() {
        assert_eq!(parse_amount_cents(&json!(10)), Ok(1000));
        assert_eq!(parse_amount_cents(&json!(10.5)), Ok(1050));
        assert_eq!(parse_amount_cents(&json!(0.125)), Ok(13));
    }

    #[test]
    fn rejects_invalid_amounts() {
        for value in [
            json!(null),
            json!(""),
            json!("  "),
            json!("-"),
            json!("1.2.3"),
            json!("abc"),
            json!("1e5"),
            json!(true),
            json!([1]),
            json!({"amount": 1}),
        ] {
            assert_eq!(parse_amount_cents(&value), Err(InvalidAmount), "{value}");
        }
    }

    #[test]
    fn converts_to_yuan() {
        assert!((cents_to_yuan(1234) - 12.34).abs() < f64::EPSILON);
    }

    #[test]
    fn prorates_with_half_away_from_zero() {
        assert_eq!(prorate_cents(1000, 15, 30), 500);
        assert_eq!(prorate_cents(1000, 1, 3), 333);
        assert_eq!(prorate_cents(1000, 2, 3), 667);
        assert_eq!(prorate_cents(-1000, 2, 3), -667);
        assert_eq!(prorate_cents(1000, 1, 0), 0);
    }
}
