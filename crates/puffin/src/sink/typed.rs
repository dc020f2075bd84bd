//! Typed Parquet output, one file per record.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Datelike;
use deltalake::arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Decimal128Array, Float64Array, Int32Array, Int64Array,
    RecordBatch, StringArray, TimestampMicrosecondArray,
};
use deltalake::parquet::arrow::ArrowWriter;
use deltalake::parquet::basic::{Compression, GzipLevel, ZstdLevel};
use deltalake::parquet::errors::ParquetError;
use deltalake::parquet::file::properties::WriterProperties;
use freshet_core::config::ParquetCompression;
use freshet_core::emit;
use freshet_core::metrics::events::{Destination, ObjectWritten};
use freshet_core::StorageProviderRef;
use snafu::ResultExt;
use tracing::debug;

use super::{ObjectKey, RecordSink, TYPED_PREFIX};
use crate::error::{
    ColumnTypeSnafu, ParquetEncodeSnafu, RecordBatchSnafu, WriteObjectSnafu, WriterError,
};
use crate::schema::{CollectionSchema, FieldType, FieldValue, SchemaField};
use crate::transform::TransformedRecord;

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub struct TypedRecordWriter {
    storage: StorageProviderRef,
    compression: ParquetCompression,
    target: String,
}

impl TypedRecordWriter {
    pub fn new(
        storage: StorageProviderRef,
        compression: ParquetCompression,
        target: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            compression,
            target: target.into(),
        }
    }

    pub fn key_for(record: &TransformedRecord) -> String {
        ObjectKey {
            collection: &record.collection,
            operation: record.operation.as_str(),
            timestamp: record.timestamp,
            document_id: record.document_id.as_deref(),
            message_id: &record.message_id,
        }
        .render(TYPED_PREFIX, "parquet")
    }
}

#[async_trait]
impl RecordSink for TypedRecordWriter {
    async fn write_record(
        &self,
        record: &TransformedRecord,
        schema: &CollectionSchema,
    ) -> Result<String, WriterError> {
        let batch = records_to_batch(schema, &[record])?;
        let encoded = encode_parquet(&batch, self.compression).context(ParquetEncodeSnafu)?;
        let bytes = encoded.len() as u64;
        let key = Self::key_for(record);

        self.storage
            .put(key.as_str(), Bytes::from(encoded))
            .await
            .context(WriteObjectSnafu { path: key.clone() })?;

        emit!(ObjectWritten {
            destination: Destination::Typed,
            bytes,
            target: self.target.clone(),
        });
        debug!(
            target = %self.target,
            collection = %record.collection,
            key = %key,
            bytes,
            "[typed] Wrote record"
        );
        Ok(key)
    }
}

/// Build a batch with one row per record, columns in schema order.
pub fn records_to_batch(
    schema: &CollectionSchema,
    records: &[&TransformedRecord],
) -> Result<RecordBatch, WriterError> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| {
            let values: Vec<&FieldValue> = records
                .iter()
                .map(|r| r.fields.get(&field.name).unwrap_or(&FieldValue::Null))
                .collect();
            column(field, &values)
        })
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(schema.arrow_schema(), columns).context(RecordBatchSnafu)
}

fn column(field: &SchemaField, values: &[&FieldValue]) -> Result<ArrayRef, WriterError> {
    let mismatch = |value: &FieldValue| {
        ColumnTypeSnafu {
            field: field.name.clone(),
            kind: value.kind(),
        }
        .build()
    };

    let array: ArrayRef = match field.field_type {
        FieldType::String => Arc::new(StringArray::from(collect(values, |v| match v {
            FieldValue::String(s) => Some(s.clone()),
            _ => None,
        }, mismatch)?)),
        FieldType::Json => Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| (!v.is_null()).then(|| v.to_json().to_string()))
                .collect::<Vec<_>>(),
        )),
        FieldType::Int32 => Arc::new(Int32Array::from(collect(values, |v| match v {
            FieldValue::Int(i) => i32::try_from(*i).ok(),
            _ => None,
        }, mismatch)?)),
        FieldType::Int64 => Arc::new(Int64Array::from(collect(values, |v| match v {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }, mismatch)?)),
        FieldType::Float64 => Arc::new(Float64Array::from(collect(values, |v| match v {
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }, mismatch)?)),
        FieldType::Boolean => Arc::new(BooleanArray::from(collect(values, |v| match v {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }, mismatch)?)),
        FieldType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(collect(values, |v| match v {
                FieldValue::Timestamp(t) => Some(t.timestamp_micros()),
                _ => None,
            }, mismatch)?)
            .with_timezone("UTC"),
        ),
        FieldType::Date => Arc::new(Date32Array::from(collect(values, |v| match v {
            FieldValue::Date(d) => Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
            _ => None,
        }, mismatch)?)),
        FieldType::Decimal { precision, scale } => Arc::new(
            Decimal128Array::from(collect(values, |v| match v {
                FieldValue::Decimal(d) if d.scale() == scale => Some(d.unscaled()),
                _ => None,
            }, mismatch)?)
            .with_precision_and_scale(precision, scale as i8)
            .context(RecordBatchSnafu)?,
        ),
    };
    Ok(array)
}

/// Map each value with `pick`, keeping nulls and failing on any non-null
/// value `pick` rejects.
fn collect<T>(
    values: &[&FieldValue],
    pick: impl Fn(&FieldValue) -> Option<T>,
    mismatch: impl Fn(&FieldValue) -> WriterError,
) -> Result<Vec<Option<T>>, WriterError> {
    values
        .iter()
        .map(|value| {
            if value.is_null() {
                return Ok(None);
            }
            pick(value).map(Some).ok_or_else(|| mismatch(value))
        })
        .collect()
}

fn writer_properties(compression: ParquetCompression) -> WriterProperties {
    let compression = match compression {
        ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
    };
    WriterProperties::builder().set_compression(compression).build()
}

/// Encode a batch as a complete Parquet file.
pub fn encode_parquet(
    batch: &RecordBatch,
    compression: ParquetCompression,
) -> Result<Vec<u8>, ParquetError> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(
        &mut buffer,
        batch.schema(),
        Some(writer_properties(compression)),
    )?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Decimal;
    use chrono::{NaiveDate, TimeZone, Utc};
    use deltalake::arrow::array::Array;
    use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use freshet_core::{Operation, StorageProvider};
    use indexmap::IndexMap;
    use serde_json::json;

    fn schema() -> CollectionSchema {
        let field = |name: &str, field_type: FieldType, nullable: bool| SchemaField {
            name: name.into(),
            field_type,
            nullable,
        };
        CollectionSchema::new(vec![
            field("pk_client", FieldType::String, false),
            field(
                "amount",
                FieldType::Decimal {
                    precision: 10,
                    scale: 2,
                },
                true,
            ),
            field("ts_created", FieldType::Timestamp, true),
            field("dt_birth", FieldType::Date, true),
            field("val_dogs", FieldType::Int64, true),
            field("raw", FieldType::Json, true),
        ])
    }

    fn record() -> TransformedRecord {
        let mut fields = IndexMap::new();
        fields.insert("pk_client".into(), FieldValue::String("c1".into()));
        fields.insert("amount".into(), FieldValue::Decimal(Decimal::new(999, 2)));
        fields.insert(
            "ts_created".into(),
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
        );
        fields.insert(
            "dt_birth".into(),
            FieldValue::Date(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()),
        );
        fields.insert("val_dogs".into(), FieldValue::Null);
        fields.insert("raw".into(), FieldValue::Json(json!({"a": 1})));
        TransformedRecord {
            collection: "customers".into(),
            operation: Operation::Insert,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            document_id: Some("c1".into()),
            message_id: "41".into(),
            generation: 1,
            fields,
        }
    }

    #[test]
    fn test_batch_columns_follow_schema() {
        let record = record();
        let batch = records_to_batch(&schema(), &[&record]).unwrap();

        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.num_columns(), 6);
        let amount = batch
            .column(1)
            .as_any()
            .downcast_ref::<Decimal128Array>()
            .unwrap();
        assert_eq!(amount.value(0), 999);
        assert_eq!(amount.value_as_string(0), "9.99");
        let dates = batch.column(3).as_any().downcast_ref::<Date32Array>().unwrap();
        assert_eq!(dates.value(0), 1);
        assert!(batch.column(4).is_null(0));
    }

    #[test]
    fn test_wrong_value_kind_is_rejected() {
        let mut record = record();
        record
            .fields
            .insert("val_dogs".into(), FieldValue::String("three".into()));
        let result = records_to_batch(&schema(), &[&record]);
        assert!(matches!(result, Err(WriterError::ColumnType { .. })));
    }

    #[tokio::test]
    async fn test_written_file_reads_back() {
        let storage = Arc::new(StorageProvider::in_memory());
        let writer = TypedRecordWriter::new(storage.clone(), ParquetCompression::Uncompressed, "test");

        let key = writer.write_record(&record(), &schema()).await.unwrap();
        assert_eq!(
            key,
            "processed/customers/c1-2024-03-01/insert_20240301_120000_41.parquet"
        );

        let bytes = storage.get(key.as_str()).await.unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 1);
        assert_eq!(batches[0].schema().field(0).name(), "pk_client");
    }
}
