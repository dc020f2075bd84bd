//! Raw archive: every bus message, byte for byte.

use async_trait::async_trait;
use freshet_core::bus::BusMessage;
use freshet_core::emit;
use freshet_core::event::document_id;
use freshet_core::metrics::events::{Destination, ObjectWritten};
use freshet_core::StorageProviderRef;
use serde_json::Value;
use snafu::ResultExt;
use tracing::debug;

use super::{ObjectKey, RAW_PREFIX, RawSink, UNKNOWN};
use crate::error::{WriteObjectSnafu, WriterError};
use crate::schema::parse_timestamp;

pub struct RawArchiveWriter {
    storage: StorageProviderRef,
    target: String,
}

impl RawArchiveWriter {
    pub fn new(storage: StorageProviderRef, target: impl Into<String>) -> Self {
        Self {
            storage,
            target: target.into(),
        }
    }

    /// Key for `message`. Unparseable payloads go under `raw/unknown/`.
    pub fn key_for(message: &BusMessage) -> String {
        let parsed: Option<Value> = serde_json::from_slice(&message.payload).ok();
        let envelope = parsed.as_ref().and_then(Value::as_object);
        let text = |field: &str| {
            envelope
                .and_then(|e| e.get(field))
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN)
        };

        let timestamp = envelope
            .and_then(|e| e.get("timestamp"))
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or(message.published_at);
        let doc_id = envelope
            .and_then(|e| e.get("document"))
            .and_then(Value::as_object)
            .and_then(document_id);
        let token = envelope
            .and_then(|e| e.get("token"))
            .filter(|t| t.is_u64())
            .map(ToString::to_string);

        ObjectKey {
            collection: text("collection"),
            operation: text("operation"),
            timestamp,
            document_id: doc_id.as_deref(),
            message_id: token.as_deref().unwrap_or(&message.id),
        }
        .render(RAW_PREFIX, "json")
    }
}

#[async_trait]
impl RawSink for RawArchiveWriter {
    async fn write_raw(&self, message: &BusMessage) -> Result<String, WriterError> {
        let key = Self::key_for(message);
        let bytes = message.payload.len() as u64;
        self.storage
            .put(key.as_str(), message.payload.clone())
            .await
            .context(WriteObjectSnafu { path: key.clone() })?;

        emit!(ObjectWritten {
            destination: Destination::Raw,
            bytes,
            target: self.target.clone(),
        });
        debug!(target = %self.target, key = %key, bytes, "[raw] Archived message");
        Ok(key)
    }
}
