//! Puffin benchmark suite.
//!
//! Benchmarks for key operations:
//! - Document flattening
//! - Envelope to typed record transformation
//! - Typed record encoding to Parquet

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use puffin::config::ParquetCompression;
use puffin::flatten::flatten;
use puffin::schema::{CollectionDefinitions, RegistrySource};
use puffin::sink::{encode_parquet, records_to_batch};
use puffin::{BusMessage, SchemaRegistry, TransformOutcome, TransformedRecord, Transformer};
use serde_json::{Map, Value, json};

const DEFINITIONS: &str = r#"
customers:
  fields:
    - { name: pk_client, type: string, nullable: false, from: _id }
    - { name: pk_yearmonth, type: int, derive: current_year_month }
    - { name: amount, type: "decimal(12,2)", from: total.amount, transform: to_decimal }
    - { name: ts_created, type: timestamp, from: created_at, transform: to_timestamp }
    - { name: val_dogs, type: int, from: dogs, transform: count }
    - { name: txt_dog_names, type: string, from: dogs, transform: "join(name)" }
    - { name: val_dog_weight, type: float64, from: dogs, transform: "sum(weight)" }
    - { name: city, type: string, from: address.city }
    - { name: is_active, type: boolean, from: active, transform: to_bool }
"#;

fn document(i: usize) -> Value {
    json!({
        "_id": format!("client_{i:08}"),
        "total": { "amount": format!("{}.{:02}", i % 10_000, i % 100) },
        "created_at": "2024-03-01T12:00:00Z",
        "dogs": [
            { "name": "Rex", "weight": 12.5 },
            { "name": "Fido", "weight": 8 }
        ],
        "address": { "city": "Lisbon", "geo": { "lat": 38.7, "lon": -9.1 } },
        "active": "yes"
    })
}

fn messages(count: usize) -> Vec<BusMessage> {
    (0..count)
        .map(|i| {
            let envelope = json!({
                "operation": "insert",
                "collection": "customers",
                "timestamp": "2024-03-01T12:00:00Z",
                "token": i,
                "document": document(i),
            });
            BusMessage {
                id: format!("{i:012}"),
                topic: "cdc-events".to_string(),
                ordering_key: "customers".to_string(),
                payload: Bytes::from(envelope.to_string()),
                published_at: Utc::now(),
            }
        })
        .collect()
}

fn transformer() -> Transformer {
    let definitions: CollectionDefinitions = serde_yaml::from_str(DEFINITIONS).unwrap();
    let registry = SchemaRegistry::load(RegistrySource::inline(definitions), "bench").unwrap();
    Transformer::new(Arc::new(registry))
}

fn flatten_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("flatten");
    let documents: Vec<Map<String, Value>> = (0..1000)
        .filter_map(|i| match document(i) {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();

    group.throughput(Throughput::Elements(documents.len() as u64));
    group.bench_function("nested_documents", |b| {
        b.iter(|| documents.iter().map(|d| flatten(d).len()).sum::<usize>());
    });
    group.finish();
}

fn transform_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform");
    let transformer = transformer();

    for size in [100, 1000, 10000] {
        let batch = messages(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("envelope", size), &batch, |b, batch| {
            b.iter(|| {
                batch
                    .iter()
                    .filter(|m| matches!(transformer.transform(m), TransformOutcome::Routed(_)))
                    .count()
            });
        });
    }

    group.finish();
}

fn parquet_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("typed_parquet");
    let transformer = transformer();
    let snapshot = transformer.registry().snapshot();
    let schema = &snapshot.get("customers").unwrap().schema;

    for size in [1, 1000] {
        let records: Vec<TransformedRecord> = messages(size)
            .iter()
            .filter_map(|m| match transformer.transform(m) {
                TransformOutcome::Routed(record) => Some(record),
                _ => None,
            })
            .collect();
        let refs: Vec<&TransformedRecord> = records.iter().collect();

        group.throughput(Throughput::Elements(size as u64));
        for compression in [ParquetCompression::Snappy, ParquetCompression::Zstd] {
            group.bench_with_input(
                BenchmarkId::new(format!("{compression:?}").to_lowercase(), size),
                &refs,
                |b, refs| {
                    b.iter(|| {
                        let batch = records_to_batch(schema, refs).unwrap();
                        encode_parquet(&batch, compression).unwrap().len()
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    flatten_benchmarks,
    transform_benchmarks,
    parquet_benchmarks
);
criterion_main!(benches);
