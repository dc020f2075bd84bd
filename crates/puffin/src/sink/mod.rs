//! Destination writers.
//!
//! Both destinations write one object per message under a key derived only
//! from message content (collection, operation, event time, document id and
//! feed token), so a redelivered message overwrites its earlier copy instead
//! of adding a second one.

mod raw;
mod typed;

pub use raw::RawArchiveWriter;
pub use typed::{TypedRecordWriter, encode_parquet, records_to_batch};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use freshet_core::bus::BusMessage;

use crate::error::WriterError;
use crate::schema::CollectionSchema;
use crate::transform::TransformedRecord;

pub const RAW_PREFIX: &str = "raw";
pub const TYPED_PREFIX: &str = "processed";
const UNKNOWN: &str = "unknown";
const ID_PREFIX_LEN: usize = 8;

/// Receives every bus message unmodified.
#[async_trait]
pub trait RawSink: Send + Sync {
    /// Returns the key written.
    async fn write_raw(&self, message: &BusMessage) -> Result<String, WriterError>;
}

/// Receives typed records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Returns the key written.
    async fn write_record(
        &self,
        record: &TransformedRecord,
        schema: &CollectionSchema,
    ) -> Result<String, WriterError>;
}

/// Parts of an object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey<'a> {
    pub collection: &'a str,
    pub operation: &'a str,
    pub timestamp: DateTime<Utc>,
    pub document_id: Option<&'a str>,
    pub message_id: &'a str,
}

impl ObjectKey<'_> {
    /// `{root}/{collection}/{id8}-{date}/{operation}_{YYYYmmdd_HHMMSS}_{message_id}.{extension}`
    pub fn render(&self, root: &str, extension: &str) -> String {
        let prefix: String = self
            .document_id
            .map(segment)
            .unwrap_or_else(|| UNKNOWN.to_string())
            .chars()
            .take(ID_PREFIX_LEN)
            .collect();
        format!(
            "{root}/{collection}/{prefix}-{date}/{operation}_{time}_{message_id}.{extension}",
            collection = segment(self.collection),
            date = self.timestamp.format("%Y-%m-%d"),
            operation = segment(self.operation),
            time = self.timestamp.format("%Y%m%d_%H%M%S"),
            message_id = segment(self.message_id),
        )
    }
}

/// Make a value safe as a single path segment.
fn segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        UNKNOWN.to_string()
    } else {
        cleaned
    }
}
