//! Typed field values and coercion from JSON.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Number, Value};
use snafu::prelude::*;

use super::FieldType;

/// Epoch values at or above this magnitude are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum ValueError {
    #[snafu(display("expected {expected}, found {found}"))]
    TypeMismatch { expected: String, found: String },

    #[snafu(display("'{value}' is not a valid decimal({precision},{scale}): {reason}"))]
    InvalidDecimal {
        value: String,
        precision: u8,
        scale: u8,
        reason: String,
    },

    #[snafu(display("'{value}' is not a valid timestamp"))]
    InvalidTimestamp { value: String },

    #[snafu(display("'{value}' is not a valid date"))]
    InvalidDate { value: String },

    #[snafu(display("{value} does not fit in {ty}"))]
    OutOfRange { value: String, ty: String },

    #[snafu(display("{transform} cannot convert {value}"))]
    Unconvertible { transform: String, value: String },
}

/// Exact fixed-point number: `unscaled * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    unscaled: i128,
    scale: u8,
}

impl Decimal {
    pub fn new(unscaled: i128, scale: u8) -> Self {
        Self { unscaled, scale }
    }

    pub fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Parse decimal text exactly at `scale`.
    ///
    /// Fractional digits beyond `scale` are rejected unless they are zeros,
    /// and the integer part must fit in `precision - scale` digits.
    pub fn parse(text: &str, precision: u8, scale: u8) -> Result<Self, ValueError> {
        let invalid = |reason: &str| ValueError::InvalidDecimal {
            value: text.to_string(),
            precision,
            scale,
            reason: reason.to_string(),
        };

        let trimmed = text.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("no digits"));
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid("not a plain decimal number"));
        }

        let significant_frac = frac_part.trim_end_matches('0');
        if significant_frac.len() > scale as usize {
            return Err(invalid("too many fractional digits"));
        }
        let significant_int = int_part.trim_start_matches('0');
        if significant_int.len() + scale as usize > precision as usize {
            return Err(invalid("too many integer digits"));
        }

        let padded_frac = significant_frac
            .bytes()
            .chain(std::iter::repeat(b'0'))
            .take(scale as usize);
        let mut unscaled: i128 = 0;
        for digit in significant_int.bytes().chain(padded_frac) {
            unscaled = unscaled * 10 + i128::from(digit - b'0');
        }
        if negative {
            unscaled = -unscaled;
        }
        Ok(Self { unscaled, scale })
    }

    pub fn from_int(value: i64, precision: u8, scale: u8) -> Result<Self, ValueError> {
        Self::parse(&value.to_string(), precision, scale)
    }

    /// Re-express at another scale without losing digits.
    pub fn rescale(self, precision: u8, scale: u8) -> Result<Self, ValueError> {
        Self::parse(&self.to_string(), precision, scale)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let magnitude = self.unscaled.unsigned_abs();
        if self.scale == 0 {
            return write!(f, "{sign}{magnitude}");
        }
        let divisor = 10u128.pow(u32::from(self.scale));
        write!(
            f,
            "{sign}{}.{:0width$}",
            magnitude / divisor,
            magnitude % divisor,
            width = self.scale as usize
        )
    }
}

/// A value ready to be written into a typed column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Json(Value),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "boolean",
            FieldValue::Int(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Decimal(_) => "decimal",
            FieldValue::String(_) => "string",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Date(_) => "date",
            FieldValue::Json(_) => "json",
        }
    }

    /// Coerce a looked-up JSON value to `ty`.
    ///
    /// Only lossless readings are accepted. Strings are parsed for
    /// timestamps, dates and decimals; anything else must already have the
    /// declared shape.
    pub fn from_json(value: &Value, ty: FieldType) -> Result<Self, ValueError> {
        if value.is_null() {
            return Ok(FieldValue::Null);
        }
        let mismatch = || ValueError::TypeMismatch {
            expected: ty.to_string(),
            found: json_kind(value).to_string(),
        };

        match ty {
            FieldType::String => match value {
                Value::String(s) => Ok(FieldValue::String(s.clone())),
                _ => Err(mismatch()),
            },
            FieldType::Int32 | FieldType::Int64 => {
                let int = match value {
                    Value::Number(n) => exact_int(n).ok_or_else(mismatch)?,
                    _ => return Err(mismatch()),
                };
                FieldValue::Int(int).conform(ty)
            }
            FieldType::Float64 => value
                .as_f64()
                .map(FieldValue::Float)
                .ok_or_else(mismatch),
            FieldType::Boolean => value
                .as_bool()
                .map(FieldValue::Bool)
                .ok_or_else(mismatch),
            FieldType::Timestamp => match value {
                Value::String(s) => parse_timestamp(s)
                    .map(FieldValue::Timestamp)
                    .ok_or_else(|| ValueError::InvalidTimestamp { value: s.clone() }),
                _ => Err(mismatch()),
            },
            FieldType::Date => match value {
                Value::String(s) => parse_date(s)
                    .map(FieldValue::Date)
                    .ok_or_else(|| ValueError::InvalidDate { value: s.clone() }),
                _ => Err(mismatch()),
            },
            FieldType::Decimal { precision, scale } => match value {
                Value::Number(n) => {
                    Decimal::parse(&n.to_string(), precision, scale).map(FieldValue::Decimal)
                }
                Value::String(s) => Decimal::parse(s, precision, scale).map(FieldValue::Decimal),
                _ => Err(mismatch()),
            },
            FieldType::Json => Ok(FieldValue::Json(value.clone())),
        }
    }

    /// Check a transform result against `ty`, widening where exact.
    pub fn conform(self, ty: FieldType) -> Result<Self, ValueError> {
        let mismatch = |found: &str| ValueError::TypeMismatch {
            expected: ty.to_string(),
            found: found.to_string(),
        };

        match (self, ty) {
            (FieldValue::Null, _) => Ok(FieldValue::Null),
            (value, FieldType::Json) => Ok(FieldValue::Json(value.to_json())),
            (FieldValue::String(s), FieldType::String) => Ok(FieldValue::String(s)),
            (FieldValue::String(s), FieldType::Timestamp | FieldType::Date | FieldType::Decimal { .. }) => {
                FieldValue::from_json(&Value::String(s), ty)
            }
            (FieldValue::Int(i), FieldType::Int64) => Ok(FieldValue::Int(i)),
            (FieldValue::Int(i), FieldType::Int32) => {
                if i32::try_from(i).is_ok() {
                    Ok(FieldValue::Int(i))
                } else {
                    Err(ValueError::OutOfRange {
                        value: i.to_string(),
                        ty: ty.to_string(),
                    })
                }
            }
            (FieldValue::Int(i), FieldType::Float64) => Ok(FieldValue::Float(i as f64)),
            (FieldValue::Int(i), FieldType::Decimal { precision, scale }) => {
                Decimal::from_int(i, precision, scale).map(FieldValue::Decimal)
            }
            (FieldValue::Float(f), FieldType::Float64) => Ok(FieldValue::Float(f)),
            (FieldValue::Float(f), FieldType::Decimal { precision, scale }) => {
                Decimal::parse(&f.to_string(), precision, scale).map(FieldValue::Decimal)
            }
            (FieldValue::Decimal(d), FieldType::Decimal { precision, scale }) => {
                d.rescale(precision, scale).map(FieldValue::Decimal)
            }
            (FieldValue::Bool(b), FieldType::Boolean) => Ok(FieldValue::Bool(b)),
            (FieldValue::Timestamp(t), FieldType::Timestamp) => Ok(FieldValue::Timestamp(t)),
            (FieldValue::Timestamp(t), FieldType::Date) => Ok(FieldValue::Date(t.date_naive())),
            (FieldValue::Date(d), FieldType::Date) => Ok(FieldValue::Date(d)),
            (other, _) => Err(mismatch(other.kind())),
        }
    }

    /// JSON rendering used for `json` columns and diagnostics.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            FieldValue::Decimal(d) => Value::String(d.to_string()),
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Timestamp(t) => {
                Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            FieldValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) => f.write_str(s),
            FieldValue::Decimal(d) => d.fmt(f),
            other => other.to_json().fmt(f),
        }
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Integer reading of a JSON number, accepting floats with no fraction.
pub(crate) fn exact_int(n: &Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}

/// Parse RFC 3339, naive ISO date-times (read as UTC), plain dates and
/// epoch seconds or milliseconds.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    text.parse::<i64>().ok().and_then(from_epoch)
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(text).map(|t| t.date_naive()))
}

pub(crate) fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MONEY: FieldType = FieldType::Decimal {
        precision: 10,
        scale: 2,
    };

    #[test]
    fn test_decimal_parse_is_exact() {
        let d = Decimal::parse("9.99", 10, 2).unwrap();
        assert_eq!(d.unscaled(), 999);
        assert_eq!(d.to_string(), "9.99");

        assert_eq!(Decimal::parse("-0.5", 10, 2).unwrap().to_string(), "-0.50");
        assert_eq!(Decimal::parse("12.3400", 10, 2).unwrap().to_string(), "12.34");
        assert_eq!(Decimal::parse("7", 10, 0).unwrap().to_string(), "7");

        assert!(Decimal::parse("9.999", 10, 2).is_err());
        assert!(Decimal::parse("123456789.0", 10, 2).is_err());
        assert!(Decimal::parse("1e3", 10, 2).is_err());
        assert!(Decimal::parse("", 10, 2).is_err());
    }

    #[test]
    fn test_from_json_keeps_decimal_digits() {
        let value = FieldValue::from_json(&json!(9.99), MONEY).unwrap();
        assert_eq!(value.to_string(), "9.99");

        let value = FieldValue::from_json(&json!("19.90"), MONEY).unwrap();
        assert_eq!(value, FieldValue::Decimal(Decimal::new(1990, 2)));
    }

    #[test]
    fn test_from_json_rejects_mismatched_types() {
        assert!(FieldValue::from_json(&json!("12"), FieldType::Int64).is_err());
        assert!(FieldValue::from_json(&json!(1.5), FieldType::Int64).is_err());
        assert!(FieldValue::from_json(&json!(3_000_000_000i64), FieldType::Int32).is_err());
        assert!(FieldValue::from_json(&json!(1), FieldType::String).is_err());
        assert_eq!(
            FieldValue::from_json(&json!(2.0), FieldType::Int64).unwrap(),
            FieldValue::Int(2)
        );
        assert_eq!(
            FieldValue::from_json(&Value::Null, FieldType::Int64).unwrap(),
            FieldValue::Null
        );
    }

    #[test]
    fn test_timestamp_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T14:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 12:00:00"), Some(expected));
        assert_eq!(parse_timestamp("1709294400"), Some(expected));
        assert_eq!(parse_timestamp("1709294400000"), Some(expected));
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn test_conform_widens_only_when_exact() {
        assert_eq!(
            FieldValue::Int(3).conform(FieldType::Float64).unwrap(),
            FieldValue::Float(3.0)
        );
        assert_eq!(
            FieldValue::Int(3).conform(MONEY).unwrap().to_string(),
            "3.00"
        );
        assert!(FieldValue::Float(0.125).conform(MONEY).is_err());
        assert!(FieldValue::Bool(true).conform(FieldType::Int64).is_err());
        assert_eq!(
            FieldValue::Int(1).conform(FieldType::Json).unwrap(),
            FieldValue::Json(json!(1))
        );
    }
}
