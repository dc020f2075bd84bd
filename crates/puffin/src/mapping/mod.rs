//! Field mappings: how each output field gets its value.
//!
//! A collection is declared once as an ordered field list. Each entry names
//! the output column, its type, and at most one rule (`from`, `literal` or
//! `derive`) with an optional transform. Compiling a definition yields the
//! collection schema and its mapping together so the two cannot drift.

mod transforms;

use std::collections::HashMap;
use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use transforms::Transform;

use crate::error::MappingError;
use crate::flatten::{FlatDocument, lookup};
use crate::schema::{CollectionSchema, FieldType, FieldValue, SchemaField, ValueError};

/// Zero-argument value generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    /// Processing time.
    Now,
    CurrentDate,
    /// `YYYYMM`, numeric for integer columns.
    CurrentYearMonth,
    Uuid,
}

impl Derivation {
    pub fn evaluate(&self, target: FieldType) -> Value {
        let now = Utc::now();
        match self {
            Derivation::Now => Value::String(now.to_rfc3339()),
            Derivation::CurrentDate => Value::String(now.format("%Y-%m-%d").to_string()),
            Derivation::CurrentYearMonth => {
                let text = now.format("%Y%m").to_string();
                match target {
                    FieldType::Int32 | FieldType::Int64 => text
                        .parse::<i64>()
                        .map(Value::from)
                        .unwrap_or(Value::String(text)),
                    _ => Value::String(text),
                }
            }
            Derivation::Uuid => Value::String(Uuid::new_v4().to_string()),
        }
    }
}

/// Where a field's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    Literal(Value),
    Derived(Derivation),
    /// Dot-joined path into the document.
    Path(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingRule {
    pub rule: FieldRule,
    pub transform: Option<Transform>,
}

impl MappingRule {
    /// Resolve the value of a field of type `target` for one document.
    pub fn resolve(
        &self,
        flat: &FlatDocument,
        document: &Map<String, Value>,
        target: FieldType,
    ) -> Result<FieldValue, ValueError> {
        let raw = match &self.rule {
            FieldRule::Literal(value) => Some(value.clone()),
            FieldRule::Derived(derivation) => Some(derivation.evaluate(target)),
            FieldRule::Path(path) => lookup(flat, document, path),
        };
        match (&self.transform, raw) {
            (Some(transform), raw) => transform.apply(raw.as_ref(), target),
            (None, Some(raw)) => FieldValue::from_json(&raw, target),
            (None, None) => Ok(FieldValue::Null),
        }
    }
}

/// Rules of one collection keyed by output field. Fields without a rule
/// resolve to null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMapping {
    rules: HashMap<String, MappingRule>,
}

impl FieldMapping {
    pub fn rule(&self, field: &str) -> Option<&MappingRule> {
        self.rules.get(field)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// One field as written in a collection definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derive: Option<Derivation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

fn default_nullable() -> bool {
    true
}

impl FieldDefinition {
    fn compile(&self, collection: &str) -> Result<Option<MappingRule>, MappingError> {
        let invalid = |message: String| MappingError::InvalidField {
            collection: collection.to_string(),
            field: self.name.clone(),
            message,
        };

        let rule = match (&self.from, &self.literal, &self.derive) {
            (None, None, None) => None,
            (Some(path), None, None) => {
                if path.trim().is_empty() {
                    return Err(invalid("'from' path is empty".into()));
                }
                Some(FieldRule::Path(path.trim().to_string()))
            }
            (None, Some(value), None) => Some(FieldRule::Literal(value.clone())),
            (None, None, Some(derivation)) => Some(FieldRule::Derived(*derivation)),
            _ => {
                return Err(invalid(
                    "at most one of 'from', 'literal' and 'derive' may be set".into(),
                ));
            }
        };

        let Some(rule) = rule else {
            if self.transform.is_some() {
                return Err(invalid("a transform needs 'from', 'literal' or 'derive'".into()));
            }
            if !self.nullable {
                return Err(invalid("a non-nullable field needs a rule".into()));
            }
            return Ok(None);
        };

        let rule = MappingRule {
            rule,
            transform: self.transform.clone(),
        };
        if let FieldRule::Literal(value) = &rule.rule {
            let typed = rule
                .resolve(&FlatDocument::new(), &Map::new(), self.field_type)
                .map_err(|e| invalid(format!("literal {value} does not fit: {e}")))?;
            if typed.is_null() && !self.nullable {
                return Err(invalid("literal is null but the field is not nullable".into()));
            }
        }
        Ok(Some(rule))
    }
}

/// A collection's fields in output order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionDefinition {
    pub fields: Vec<FieldDefinition>,
}

impl CollectionDefinition {
    /// Validate and split into the schema and its paired mapping.
    pub fn compile(&self, collection: &str) -> Result<(CollectionSchema, FieldMapping), MappingError> {
        if self.fields.is_empty() {
            return Err(MappingError::EmptySchema {
                collection: collection.to_string(),
            });
        }

        let mut seen = HashSet::with_capacity(self.fields.len());
        let mut schema_fields = Vec::with_capacity(self.fields.len());
        let mut rules = HashMap::with_capacity(self.fields.len());

        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(MappingError::InvalidField {
                    collection: collection.to_string(),
                    field: field.name.clone(),
                    message: "field name is empty".into(),
                });
            }
            if !seen.insert(field.name.as_str()) {
                return Err(MappingError::DuplicateField {
                    collection: collection.to_string(),
                    field: field.name.clone(),
                });
            }
            if let Some(rule) = field.compile(collection)? {
                rules.insert(field.name.clone(), rule);
            }
            schema_fields.push(SchemaField {
                name: field.name.clone(),
                field_type: field.field_type,
                nullable: field.nullable,
            });
        }

        Ok((CollectionSchema::new(schema_fields), FieldMapping { rules }))
    }
}
