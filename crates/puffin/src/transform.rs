//! Turning one bus message into one typed record.
//!
//! `Transformer::transform` never fails: every message ends up routed,
//! skipped or dead-lettered, and callers branch on the returned outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use freshet_core::bus::BusMessage;
use freshet_core::event::document_id;
use freshet_core::{DeadLetterRecord, Operation, ResumeToken};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use snafu::ResultExt;

use crate::error::{EnvelopeSnafu, FieldSnafu, TransformError};
use crate::flatten::flatten;
use crate::schema::{FieldValue, RegisteredCollection, RegistrySnapshot, SchemaRegistry};

/// The bus envelope as the router reads it. Only `operation` is required;
/// a missing collection is a skip, not an error. Envelopes are only decoded
/// strictly once their collection is known to be registered.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub operation: Operation,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub document: Map<String, Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token: Option<ResumeToken>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn from_value(value: Value) -> Result<Self, TransformError> {
        serde_json::from_value(value).context(EnvelopeSnafu)
    }

    /// Event time, or `fallback` when the envelope has none.
    pub fn event_time(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp.unwrap_or(fallback)
    }

    /// Identity stable across redeliveries: the feed token when present,
    /// otherwise the bus message id.
    pub fn message_id(&self, message: &BusMessage) -> String {
        match self.token {
            Some(token) => token.to_string(),
            None => message.id.clone(),
        }
    }
}

/// Output of a successful transform. Field order follows the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub collection: String,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    pub document_id: Option<String>,
    pub message_id: String,
    /// Registry generation the record was built with.
    pub generation: u64,
    pub fields: IndexMap<String, FieldValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingCollection,
    Unregistered,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingCollection => "missing_collection",
            SkipReason::Unregistered => "unregistered",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Routed(TransformedRecord),
    Skipped(SkipReason),
    DeadLetter(DeadLetterRecord),
}

pub struct Transformer {
    registry: Arc<SchemaRegistry>,
}

impl Transformer {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Transform against the registry's current snapshot.
    pub fn transform(&self, message: &BusMessage) -> TransformOutcome {
        transform_with(&self.registry.snapshot(), message)
    }
}

/// Transform `message` against a fixed snapshot.
pub fn transform_with(snapshot: &RegistrySnapshot, message: &BusMessage) -> TransformOutcome {
    let value: Value = match serde_json::from_slice(&message.payload).context(EnvelopeSnafu) {
        Ok(value) => value,
        Err(e) => return dead_letter(message, &e),
    };
    match value.get("collection") {
        None | Some(Value::Null) => return TransformOutcome::Skipped(SkipReason::MissingCollection),
        Some(Value::String(name)) if snapshot.get(name).is_none() => {
            return TransformOutcome::Skipped(SkipReason::Unregistered);
        }
        _ => {}
    }

    let envelope = match Envelope::from_value(value) {
        Ok(envelope) => envelope,
        Err(e) => return dead_letter(message, &e),
    };
    let Some(collection) = envelope.collection.as_deref() else {
        return TransformOutcome::Skipped(SkipReason::MissingCollection);
    };
    let Some(registered) = snapshot.get(collection) else {
        return TransformOutcome::Skipped(SkipReason::Unregistered);
    };

    match build_fields(registered, &envelope.document) {
        Ok(fields) => TransformOutcome::Routed(TransformedRecord {
            collection: collection.to_string(),
            operation: envelope.operation,
            timestamp: envelope.event_time(message.published_at),
            document_id: document_id(&envelope.document),
            message_id: envelope.message_id(message),
            generation: snapshot.generation(),
            fields,
        }),
        Err(e) => dead_letter(message, &e),
    }
}

/// Resolve every schema field, in schema order. One failing field fails
/// the whole record.
fn build_fields(
    registered: &RegisteredCollection,
    document: &Map<String, Value>,
) -> Result<IndexMap<String, FieldValue>, TransformError> {
    let flat = flatten(document);
    let mut fields = IndexMap::with_capacity(registered.schema.len());

    for field in registered.schema.fields() {
        let value = match registered.mapping.rule(&field.name) {
            Some(rule) => {
                let value = rule
                    .resolve(&flat, document, field.field_type)
                    .context(FieldSnafu {
                        field: field.name.clone(),
                    })?;
                if value.is_null() && !field.nullable {
                    return Err(TransformError::NullValue {
                        field: field.name.clone(),
                    });
                }
                value
            }
            None => FieldValue::Null,
        };
        fields.insert(field.name.clone(), value);
    }
    Ok(fields)
}

fn dead_letter(message: &BusMessage, error: &TransformError) -> TransformOutcome {
    TransformOutcome::DeadLetter(DeadLetterRecord::new(
        String::from_utf8_lossy(&message.payload),
        error.to_string(),
        error.stage(),
    ))
}
