//! Declared collection schemas and the typed values that fill them.

mod registry;
mod value;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use deltalake::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};

pub use registry::{
    CollectionDefinitions, RegisteredCollection, RegistrySnapshot, RegistrySource, SchemaRegistry,
};
pub use value::{Decimal, FieldValue, ValueError, parse_date, parse_timestamp};
pub(crate) use value::{exact_int, from_epoch, json_kind};

/// Largest precision a Decimal128 column can hold.
pub const MAX_DECIMAL_PRECISION: u8 = 38;

/// Declared type of an output field.
///
/// Written in YAML as `string`, `int64`, `decimal(10,2)` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    String,
    Int32,
    Int64,
    Float64,
    Boolean,
    Timestamp,
    Date,
    /// Any JSON value, stored as its text.
    Json,
    Decimal { precision: u8, scale: u8 },
}

impl FieldType {
    pub fn to_arrow_type(self) -> DataType {
        match self {
            FieldType::String | FieldType::Json => DataType::Utf8,
            FieldType::Int32 => DataType::Int32,
            FieldType::Int64 => DataType::Int64,
            FieldType::Float64 => DataType::Float64,
            FieldType::Boolean => DataType::Boolean,
            FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            FieldType::Date => DataType::Date32,
            FieldType::Decimal { precision, scale } => DataType::Decimal128(precision, scale as i8),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("string"),
            FieldType::Int32 => f.write_str("int32"),
            FieldType::Int64 => f.write_str("int64"),
            FieldType::Float64 => f.write_str("float64"),
            FieldType::Boolean => f.write_str("boolean"),
            FieldType::Timestamp => f.write_str("timestamp"),
            FieldType::Date => f.write_str("date"),
            FieldType::Json => f.write_str("json"),
            FieldType::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let simple = match normalized.as_str() {
            "string" | "utf8" => Some(FieldType::String),
            "int32" => Some(FieldType::Int32),
            "int64" | "int" => Some(FieldType::Int64),
            "float64" | "float" | "double" => Some(FieldType::Float64),
            "boolean" | "bool" => Some(FieldType::Boolean),
            "timestamp" => Some(FieldType::Timestamp),
            "date" => Some(FieldType::Date),
            "json" => Some(FieldType::Json),
            _ => None,
        };
        if let Some(simple) = simple {
            return Ok(simple);
        }

        let args = normalized
            .strip_prefix("decimal(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| format!("unknown field type '{s}'"))?;
        let (precision, scale) = args
            .split_once(',')
            .ok_or_else(|| format!("decimal type '{s}' needs a precision and a scale"))?;
        let precision: u8 = precision
            .trim()
            .parse()
            .map_err(|_| format!("invalid decimal precision in '{s}'"))?;
        let scale: u8 = scale
            .trim()
            .parse()
            .map_err(|_| format!("invalid decimal scale in '{s}'"))?;
        if precision == 0 || precision > MAX_DECIMAL_PRECISION || scale > precision {
            return Err(format!(
                "decimal type '{s}' must satisfy 0 < precision <= {MAX_DECIMAL_PRECISION} and scale <= precision"
            ));
        }
        Ok(FieldType::Decimal { precision, scale })
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

/// Ordered output fields of one collection. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSchema {
    fields: Vec<SchemaField>,
    arrow: SchemaRef,
}

impl CollectionSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        let arrow = Arc::new(Schema::new(
            fields
                .iter()
                .map(|f| Field::new(&f.name, f.field_type.to_arrow_type(), f.nullable))
                .collect::<Vec<_>>(),
        ));
        Self { fields, arrow }
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        self.arrow.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_types() {
        assert_eq!("string".parse::<FieldType>().unwrap(), FieldType::String);
        assert_eq!("Int64".parse::<FieldType>().unwrap(), FieldType::Int64);
        assert_eq!(
            "decimal(10, 2)".parse::<FieldType>().unwrap(),
            FieldType::Decimal {
                precision: 10,
                scale: 2
            }
        );
        assert!("decimal(2,3)".parse::<FieldType>().is_err());
        assert!("decimal(39,2)".parse::<FieldType>().is_err());
        assert!("uuid".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_field_type_yaml_roundtrip() {
        let ty: FieldType = serde_yaml::from_str("\"decimal(12,4)\"").unwrap();
        assert_eq!(ty.to_string(), "decimal(12,4)");
        assert_eq!(ty.to_arrow_type(), DataType::Decimal128(12, 4));
    }

    #[test]
    fn test_arrow_schema_follows_field_order() {
        let schema = CollectionSchema::new(vec![
            SchemaField {
                name: "pk".into(),
                field_type: FieldType::String,
                nullable: false,
            },
            SchemaField {
                name: "ts".into(),
                field_type: FieldType::Timestamp,
                nullable: true,
            },
        ]);

        let arrow = schema.arrow_schema();
        assert_eq!(arrow.fields().len(), 2);
        assert_eq!(arrow.field(0).name(), "pk");
        assert!(!arrow.field(0).is_nullable());
        assert_eq!(
            arrow.field(1).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
    }
}
