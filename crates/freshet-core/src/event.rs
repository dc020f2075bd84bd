//! Change events and the envelope published to the bus.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Ordered position in the change feed.
///
/// Comparisons follow feed order. The value is opaque outside the feed that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(u64);

impl ResumeToken {
    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    pub const fn position(&self) -> u64 {
        self.0
    }

    /// Number of positions between `earlier` and `self`, zero if not after it.
    pub fn distance_from(&self, earlier: Option<ResumeToken>) -> u64 {
        match earlier {
            Some(earlier) => self.0.saturating_sub(earlier.0),
            None => self.0,
        }
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Replace,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Replace => "replace",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change read from the source. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub token: ResumeToken,
    pub collection: String,
    pub operation: Operation,
    /// Full document for insert/update/replace, the document key for delete.
    #[serde(default)]
    pub document: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        token: ResumeToken,
        collection: impl Into<String>,
        operation: Operation,
        document: Map<String, Value>,
    ) -> Self {
        Self {
            token,
            collection: collection.into(),
            operation,
            document,
            timestamp: Utc::now(),
        }
    }

    /// Key that keeps events of one collection in order on the bus.
    pub fn ordering_key(&self) -> &str {
        &self.collection
    }
}

/// Envelope carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub operation: Operation,
    pub collection: String,
    #[serde(default)]
    pub document: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub token: ResumeToken,
    pub correlation_id: String,
}

impl ChangeMessage {
    pub fn from_event(event: &ChangeEvent) -> Self {
        Self {
            operation: event.operation,
            collection: event.collection.clone(),
            document: event.document.clone(),
            timestamp: event.timestamp,
            token: event.token,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Identity of the changed document, used to key idempotent writes.
    pub fn document_id(&self) -> Option<String> {
        document_id(&self.document)
    }
}

/// Extract `_id` as a string. Extended-JSON `{"$oid": ...}` ids are unwrapped.
pub fn document_id(document: &Map<String, Value>) -> Option<String> {
    match document.get("_id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(wrapped) => wrapped
            .get("$oid")
            .or_else(|| wrapped.get("$uuid"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
