//! Named transforms applied to a looked-up value before it is typed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flatten::unwrap_extended;
use crate::schema::{
    Decimal, FieldType, FieldValue, ValueError, exact_int, from_epoch, json_kind, parse_date,
    parse_timestamp,
};

const JOIN_SEPARATOR: &str = ", ";
const MAX_VALUE_PREVIEW: usize = 64;

/// A transform named in a collection definition, e.g. `to_decimal` or
/// `join(name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Transform {
    ToTimestamp,
    ToDate,
    ToInt,
    ToFloat,
    ToDecimal,
    ToString,
    ToBool,
    ToJson,
    /// Array length, 0 for anything that is not an array.
    Count,
    /// Comma-joined values of an array, or of one field of an array of objects.
    Join(Option<String>),
    /// Sum of a numeric field across an array of objects.
    Sum(String),
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::ToTimestamp => "to_timestamp",
            Transform::ToDate => "to_date",
            Transform::ToInt => "to_int",
            Transform::ToFloat => "to_float",
            Transform::ToDecimal => "to_decimal",
            Transform::ToString => "to_string",
            Transform::ToBool => "to_bool",
            Transform::ToJson => "to_json",
            Transform::Count => "count",
            Transform::Join(_) => "join",
            Transform::Sum(_) => "sum",
        }
    }

    /// Apply to `value`, producing a value of `target`.
    ///
    /// A missing or null input stays null for the conversions and counts as
    /// empty for the array aggregates.
    pub fn apply(&self, value: Option<&Value>, target: FieldType) -> Result<FieldValue, ValueError> {
        let value = match value {
            Some(value) => unwrap_extended(value),
            None => Value::Null,
        };
        let result = match self {
            Transform::Count => Ok(FieldValue::Int(match &value {
                Value::Array(items) => items.len() as i64,
                _ => 0,
            })),
            Transform::Join(field) => Ok(FieldValue::String(join(&value, field.as_deref()))),
            Transform::Sum(field) => Ok(sum(&value, field)),
            _ if value.is_null() => Ok(FieldValue::Null),
            Transform::ToTimestamp | Transform::ToDate => self.to_timestamp(&value),
            Transform::ToInt => self.to_int(&value),
            Transform::ToFloat => self.to_float(&value),
            Transform::ToDecimal => self.to_decimal(&value, target),
            Transform::ToString => Ok(FieldValue::String(scalar_text(&value))),
            Transform::ToBool => self.to_bool(&value),
            Transform::ToJson => Ok(FieldValue::Json(value)),
        }?;
        result.conform(target)
    }

    fn unconvertible(&self, value: &Value) -> ValueError {
        let mut preview = value.to_string();
        if preview.len() > MAX_VALUE_PREVIEW {
            let cut = (0..=MAX_VALUE_PREVIEW)
                .rev()
                .find(|i| preview.is_char_boundary(*i))
                .unwrap_or(0);
            preview.truncate(cut);
            preview.push_str("...");
        }
        ValueError::Unconvertible {
            transform: self.name().to_string(),
            value: format!("{} {preview}", json_kind(value)),
        }
    }

    fn to_timestamp(&self, value: &Value) -> Result<FieldValue, ValueError> {
        let parsed = match value {
            Value::String(s) if matches!(self, Transform::ToDate) => {
                parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)).map(|d| d.and_utc())
            }
            Value::String(s) => parse_timestamp(s),
            Value::Number(n) => exact_int(n).and_then(from_epoch),
            _ => None,
        };
        parsed
            .map(FieldValue::Timestamp)
            .ok_or_else(|| self.unconvertible(value))
    }

    fn to_int(&self, value: &Value) -> Result<FieldValue, ValueError> {
        let parsed = match value {
            Value::Number(n) => exact_int(n).or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                    .map(|f| f.trunc() as i64)
            }),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        };
        parsed.map(FieldValue::Int).ok_or_else(|| self.unconvertible(value))
    }

    fn to_float(&self, value: &Value) -> Result<FieldValue, ValueError> {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        };
        parsed
            .map(FieldValue::Float)
            .ok_or_else(|| self.unconvertible(value))
    }

    fn to_decimal(&self, value: &Value, target: FieldType) -> Result<FieldValue, ValueError> {
        let FieldType::Decimal { precision, scale } = target else {
            return Err(ValueError::TypeMismatch {
                expected: target.to_string(),
                found: "decimal".to_string(),
            });
        };
        match value {
            Value::Number(n) => Decimal::parse(&n.to_string(), precision, scale),
            Value::String(s) => Decimal::parse(s, precision, scale),
            _ => Err(self.unconvertible(value)),
        }
        .map(FieldValue::Decimal)
    }

    fn to_bool(&self, value: &Value) -> Result<FieldValue, ValueError> {
        let parsed = match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => exact_int(n).map(|i| i != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        };
        parsed.map(FieldValue::Bool).ok_or_else(|| self.unconvertible(value))
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn join(value: &Value, field: Option<&str>) -> String {
    let Value::Array(items) = value else {
        return String::new();
    };
    items
        .iter()
        .filter_map(|item| match field {
            Some(field) => item.as_object()?.get(field),
            None => Some(item),
        })
        .filter(|item| !item.is_null())
        .map(scalar_text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(JOIN_SEPARATOR)
}

fn sum(value: &Value, field: &str) -> FieldValue {
    let Value::Array(items) = value else {
        return FieldValue::Null;
    };
    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut seen = false;
    let mut all_ints = true;

    for item in items {
        let Some(raw) = item.as_object().and_then(|o| o.get(field)) else {
            continue;
        };
        match unwrap_extended(raw) {
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                let Some(i) = n.as_i64() else { continue };
                seen = true;
                int_total = int_total.saturating_add(i);
                float_total += i as f64;
            }
            Value::Number(n) => {
                let Some(f) = n.as_f64() else { continue };
                seen = true;
                all_ints = false;
                float_total += f;
            }
            Value::String(s) => {
                let Ok(f) = s.trim().parse::<f64>() else {
                    continue;
                };
                seen = true;
                all_ints = false;
                float_total += f;
            }
            _ => {}
        }
    }

    match (seen, all_ints) {
        (false, _) => FieldValue::Null,
        (true, true) => FieldValue::Int(int_total),
        (true, false) => FieldValue::Float(float_total),
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Join(Some(field)) | Transform::Sum(field) => {
                write!(f, "{}({field})", self.name())
            }
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Transform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, arg) = match s.split_once('(') {
            Some((name, rest)) => {
                let arg = rest
                    .strip_suffix(')')
                    .ok_or_else(|| format!("unbalanced parentheses in transform '{s}'"))?
                    .trim();
                (name.trim(), (!arg.is_empty()).then(|| arg.to_string()))
            }
            None => (s, None),
        };

        let transform = match (name, arg) {
            ("to_timestamp", None) => Transform::ToTimestamp,
            ("to_date", None) => Transform::ToDate,
            ("to_int", None) => Transform::ToInt,
            ("to_float", None) => Transform::ToFloat,
            ("to_decimal", None) => Transform::ToDecimal,
            ("to_string", None) => Transform::ToString,
            ("to_bool", None) => Transform::ToBool,
            ("to_json", None) => Transform::ToJson,
            ("count", None) => Transform::Count,
            ("join", arg) => Transform::Join(arg),
            ("sum", Some(field)) => Transform::Sum(field),
            ("sum", None) => return Err("transform 'sum' needs a field, e.g. sum(weight)".into()),
            (
                "to_timestamp" | "to_date" | "to_int" | "to_float" | "to_decimal" | "to_string"
                | "to_bool" | "to_json" | "count",
                Some(_),
            ) => return Err(format!("transform '{name}' takes no argument")),
            _ => return Err(format!("unknown transform '{s}'")),
        };
        Ok(transform)
    }
}

impl TryFrom<String> for Transform {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Transform> for String {
    fn from(value: Transform) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    fn apply(name: &str, value: Value, target: FieldType) -> Result<FieldValue, ValueError> {
        name.parse::<Transform>().unwrap().apply(Some(&value), target)
    }

    #[test]
    fn test_parse_transform_names() {
        assert_eq!("to_decimal".parse::<Transform>().unwrap(), Transform::ToDecimal);
        assert_eq!(
            "join(name)".parse::<Transform>().unwrap(),
            Transform::Join(Some("name".into()))
        );
        assert_eq!("join".parse::<Transform>().unwrap(), Transform::Join(None));
        assert_eq!(
            " sum( weight ) ".parse::<Transform>().unwrap(),
            Transform::Sum("weight".into())
        );
        assert!("sum".parse::<Transform>().is_err());
        assert!("to_int(x)".parse::<Transform>().is_err());
        assert!("uppercase".parse::<Transform>().is_err());
        assert!("join(name".parse::<Transform>().is_err());
        assert_eq!(Transform::Sum("weight".into()).to_string(), "sum(weight)");
    }

    #[test]
    fn test_to_decimal_is_exact() {
        let money = FieldType::Decimal {
            precision: 10,
            scale: 2,
        };
        assert_eq!(
            apply("to_decimal", json!("9.99"), money).unwrap().to_string(),
            "9.99"
        );
        assert_eq!(
            apply("to_decimal", json!(12), money).unwrap().to_string(),
            "12.00"
        );
        assert!(apply("to_decimal", json!("9.999"), money).is_err());
        assert!(apply("to_decimal", json!("abc"), money).is_err());
        assert!(apply("to_decimal", json!("1"), FieldType::Int64).is_err());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            apply("to_int", json!(" 42 "), FieldType::Int64).unwrap(),
            FieldValue::Int(42)
        );
        assert_eq!(
            apply("to_int", json!(3.7), FieldType::Int64).unwrap(),
            FieldValue::Int(3)
        );
        assert!(apply("to_int", json!("forty"), FieldType::Int64).is_err());
        assert_eq!(
            apply("to_float", json!("0.5"), FieldType::Float64).unwrap(),
            FieldValue::Float(0.5)
        );
        assert_eq!(
            apply("to_bool", json!("Yes"), FieldType::Boolean).unwrap(),
            FieldValue::Bool(true)
        );
        assert_eq!(
            apply("to_string", json!(12), FieldType::String).unwrap(),
            FieldValue::String("12".into())
        );
        assert_eq!(
            apply("to_json", json!({"a": 1}), FieldType::Json).unwrap(),
            FieldValue::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_time_conversions() {
        assert_eq!(
            apply("to_timestamp", json!("2024-03-01T12:00:00Z"), FieldType::Timestamp).unwrap(),
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(
            apply("to_timestamp", json!(1709294400000i64), FieldType::Timestamp).unwrap(),
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(
            apply("to_date", json!("2024-03-01"), FieldType::Date).unwrap(),
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert!(apply("to_timestamp", json!("yesterday"), FieldType::Timestamp).is_err());
    }

    #[test]
    fn test_null_input_stays_null() {
        let transform = Transform::ToInt;
        assert_eq!(
            transform.apply(None, FieldType::Int64).unwrap(),
            FieldValue::Null
        );
        assert_eq!(
            transform.apply(Some(&Value::Null), FieldType::Int64).unwrap(),
            FieldValue::Null
        );
    }

    #[test]
    fn test_array_aggregates() {
        let dogs = json!([
            {"name": "rex", "weight": 12},
            {"name": "fido", "weight": "7.5"},
            {"weight": 3}
        ]);
        assert_eq!(
            apply("count", dogs.clone(), FieldType::Int64).unwrap(),
            FieldValue::Int(3)
        );
        assert_eq!(
            apply("join(name)", dogs.clone(), FieldType::String).unwrap(),
            FieldValue::String("rex, fido".into())
        );
        assert_eq!(
            apply("sum(weight)", dogs, FieldType::Float64).unwrap(),
            FieldValue::Float(22.5)
        );
        assert_eq!(
            apply("join", json!(["a", 1, null]), FieldType::String).unwrap(),
            FieldValue::String("a, 1".into())
        );
        assert_eq!(
            apply("count", json!("not a list"), FieldType::Int64).unwrap(),
            FieldValue::Int(0)
        );
        assert_eq!(
            Transform::Sum("w".into()).apply(None, FieldType::Int64).unwrap(),
            FieldValue::Null
        );
    }
}
