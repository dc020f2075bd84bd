//! Integration tests for the freshet ingester
//!
//! Run with: cargo test -p freshet --test ingester_tests

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use freshet::checkpoint::MemoryCheckpointStore;
use freshet::config::{PipelineConfig, PipelineKey};
use freshet::error::{PipelineError, ReaderError};
use freshet::source::MemoryFeed;
use freshet::{ChangeEvent, IngestReport, Ingester, Operation, ResumeToken};
use freshet_core::bus::MemoryBus;
use freshet_core::{ChangeMessage, FailureStage, MemoryDeadLetterSink, MessageBus};
use serde_json::{Map, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "cdc-events";

fn config(yaml_overrides: &str) -> PipelineConfig {
    let base = r#"
source:
  path: "memory://"
  idle_poll_ms: 5
  reconnect:
    max_attempts: 3
    initial_backoff_ms: 0
    max_backoff_ms: 0
    jitter: 0.0
bus:
  path: "memory://"
checkpoint:
  path: "memory://"
  commit_every_events: 1000
  commit_interval_secs: 3600
publisher:
  workers: 4
  retry:
    max_attempts: 1
    initial_backoff_ms: 0
    max_backoff_ms: 0
    jitter: 0.0
"#;
    let mut value: serde_yaml::Value = serde_yaml::from_str(base).unwrap();
    let overrides: serde_yaml::Value = serde_yaml::from_str(yaml_overrides).unwrap();
    merge(&mut value, overrides);
    serde_yaml::from_value(value).unwrap()
}

fn merge(base: &mut serde_yaml::Value, overrides: serde_yaml::Value) {
    match (base, overrides) {
        (_, serde_yaml::Value::Null) => {}
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

fn event(token: u64, collection: &str) -> ChangeEvent {
    let mut document = Map::new();
    document.insert("_id".into(), json!(format!("doc-{token}")));
    document.insert("n".into(), json!(token));
    ChangeEvent::new(ResumeToken::new(token), collection, Operation::Insert, document)
}

struct Harness {
    feed: MemoryFeed,
    bus: Arc<dyn MessageBus>,
    store: Arc<MemoryCheckpointStore>,
    dlq: Arc<MemoryDeadLetterSink>,
}

impl Harness {
    fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            feed: MemoryFeed::new(),
            bus,
            store: Arc::new(MemoryCheckpointStore::new()),
            dlq: Arc::new(MemoryDeadLetterSink::new()),
        }
    }

    fn spawn(
        &self,
        config: PipelineConfig,
        shutdown: &CancellationToken,
    ) -> JoinHandle<Result<IngestReport, PipelineError>> {
        let ingester = Ingester::new(
            PipelineKey::new("orders"),
            config,
            Arc::new(self.feed.clone()),
            self.bus.clone(),
            self.store.clone(),
            self.dlq.clone(),
        );
        tokio::spawn(ingester.run(shutdown.clone()))
    }

    fn token(&self) -> Option<ResumeToken> {
        self.store.token("orders")
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn published_tokens(bus: &MemoryBus) -> Vec<u64> {
    bus.messages(TOPIC)
        .iter()
        .map(|m| {
            let message: ChangeMessage = serde_json::from_slice(&m.payload).unwrap();
            message.token.position()
        })
        .collect()
}

mod replay_tests {
    use super::*;

    /// 950 of 1000 events published, then the process dies before the first
    /// count-based commit. The restart must begin from the start of the feed
    /// and end with every event published at least once.
    #[tokio::test]
    async fn test_crash_before_first_commit_replays_from_start() {
        let bus = MemoryBus::new();
        let harness = Harness::new(Arc::new(bus.clone()));
        harness.feed.extend((1..=950).map(|n| event(n, "orders")));

        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(""), &shutdown);
        wait_until("950 publishes", || bus.messages(TOPIC).len() >= 950).await;

        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());
        assert_eq!(harness.token(), None);
        assert_eq!(harness.store.puts(), 0);

        harness.feed.extend((951..=1000).map(|n| event(n, "orders")));
        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(""), &shutdown);
        wait_until("replay", || bus.messages(TOPIC).len() >= 950 + 1000).await;
        shutdown.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.resumed_from, None);
        assert_eq!(harness.feed.opens().last(), Some(&None));
        assert_eq!(harness.token(), Some(ResumeToken::new(1000)));

        let distinct: BTreeSet<u64> = published_tokens(&bus).into_iter().collect();
        assert_eq!(distinct, (1..=1000).collect());
    }

    #[tokio::test]
    async fn test_graceful_restart_resumes_after_checkpoint() {
        let bus = MemoryBus::new();
        let harness = Harness::new(Arc::new(bus.clone()));
        harness.feed.extend((1..=20).map(|n| event(n, "orders")));

        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(""), &shutdown);
        wait_until("first run", || bus.messages(TOPIC).len() >= 20).await;
        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(harness.token(), Some(ResumeToken::new(20)));

        harness.feed.extend((21..=25).map(|n| event(n, "orders")));
        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(""), &shutdown);
        wait_until("second run", || bus.messages(TOPIC).len() >= 25).await;
        shutdown.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.resumed_from, Some(ResumeToken::new(20)));
        assert_eq!(published_tokens(&bus), (1..=25).collect::<Vec<_>>());
    }
}

mod ordering_tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use freshet_core::BusError;
    use tokio::sync::Semaphore;

    /// Holds the publish of one token until the gate is opened.
    struct GatedBus {
        inner: MemoryBus,
        held: ResumeToken,
        gate: Semaphore,
    }

    #[async_trait]
    impl MessageBus for GatedBus {
        async fn publish(
            &self,
            topic: &str,
            payload: Bytes,
            ordering_key: &str,
        ) -> Result<String, BusError> {
            let message: ChangeMessage = serde_json::from_slice(&payload).unwrap();
            if message.token == self.held {
                let _permit = self.gate.acquire().await.map_err(|_| BusError::Closed)?;
            }
            self.inner.publish(topic, payload, ordering_key).await
        }
    }

    #[tokio::test]
    async fn test_slow_worker_holds_back_checkpoint() {
        let memory = MemoryBus::new();
        let bus = Arc::new(GatedBus {
            inner: memory.clone(),
            held: ResumeToken::new(5),
            gate: Semaphore::new(0),
        });
        let harness = Harness::new(bus.clone());
        harness.feed.extend((1..=50).map(|n| {
            let collection = if n == 5 { "slow" } else { "fast" };
            event(n, collection)
        }));

        let overrides = "checkpoint: { commit_every_events: 1 }\npublisher: { publish_timeout_secs: 60 }";
        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(overrides), &shutdown);

        wait_until("fast events", || memory.messages(TOPIC).len() >= 49).await;
        wait_until("checkpoint below the slow event", || {
            harness.token() == Some(ResumeToken::new(4))
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.token(), Some(ResumeToken::new(4)));

        bus.gate.add_permits(1);
        wait_until("checkpoint past the slow event", || {
            harness.token() == Some(ResumeToken::new(50))
        })
        .await;

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_same_collection_published_in_order() {
        let bus = MemoryBus::new();
        bus.set_latency(Duration::from_millis(1));
        let harness = Harness::new(Arc::new(bus.clone()));
        harness.feed.extend((1..=200).map(|n| {
            let collection = ["orders", "customers", "items"][(n % 3) as usize];
            event(n, collection)
        }));

        let shutdown = CancellationToken::new();
        let run = harness.spawn(config("publisher: { workers: 8 }"), &shutdown);
        wait_until("all publishes", || bus.messages(TOPIC).len() >= 200).await;
        shutdown.cancel();
        run.await.unwrap().unwrap();

        for collection in ["orders", "customers", "items"] {
            let tokens: Vec<u64> = bus
                .messages(TOPIC)
                .iter()
                .filter(|m| m.ordering_key == collection)
                .map(|m| {
                    let message: ChangeMessage = serde_json::from_slice(&m.payload).unwrap();
                    message.token.position()
                })
                .collect();
            let mut sorted = tokens.clone();
            sorted.sort_unstable();
            assert_eq!(tokens, sorted, "{collection} out of order");
        }
    }
}

mod breaker_tests {
    use super::*;

    #[tokio::test]
    async fn test_breaker_opens_short_circuits_and_recovers() {
        let bus = MemoryBus::new();
        bus.set_failing(true);
        let harness = Harness::new(Arc::new(bus.clone()));
        harness.feed.extend((1..=10).map(|n| event(n, "orders")));

        let overrides = "publisher: { workers: 1 }\nbreaker: { failure_threshold: 3, cooldown_secs: 1 }";
        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(overrides), &shutdown);

        wait_until("dead letters", || harness.dlq.len() >= 10).await;
        let stages: Vec<_> = harness.dlq.records().iter().map(|r| r.stage).collect();
        assert_eq!(&stages[..3], &[FailureStage::Publish; 3]);
        assert!(stages[3..].iter().all(|s| *s == FailureStage::CircuitOpen));
        assert_eq!(bus.publish_attempts(), 3);

        bus.set_failing(false);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        harness.feed.extend((11..=15).map(|n| event(n, "orders")));
        wait_until("recovery", || bus.messages(TOPIC).len() >= 5).await;

        shutdown.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(harness.dlq.len(), 10);
        assert_eq!(report.publish.published, 5);
        assert_eq!(report.publish.short_circuited, 7);
        // Dead-lettered events still move the checkpoint.
        assert_eq!(harness.token(), Some(ResumeToken::new(15)));
    }
}

mod backpressure_tests {
    use super::*;

    #[tokio::test]
    async fn test_small_queue_drops_nothing() {
        let bus = MemoryBus::new();
        bus.set_latency(Duration::from_millis(2));
        let harness = Harness::new(Arc::new(bus.clone()));
        harness.feed.extend((1..=300).map(|n| event(n, "orders")));

        let overrides = "queue: { capacity: 10 }\npublisher: { workers: 2 }";
        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(overrides), &shutdown);
        wait_until("all publishes", || bus.messages(TOPIC).len() >= 300).await;
        shutdown.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(published_tokens(&bus), (1..=300).collect::<Vec<_>>());
        assert_eq!(report.reader.events_read, 300);
        assert!(harness.dlq.is_empty());
        assert_eq!(harness.token(), Some(ResumeToken::new(300)));
    }

    #[tokio::test]
    async fn test_filtered_collections_are_not_published() {
        let bus = MemoryBus::new();
        let harness = Harness::new(Arc::new(bus.clone()));
        harness.feed.extend((1..=10).map(|n| {
            let collection = if n % 2 == 0 { "orders" } else { "audit_log" };
            event(n, collection)
        }));

        let shutdown = CancellationToken::new();
        let run = harness.spawn(config("source: { collections: [orders] }"), &shutdown);
        wait_until("publishes", || bus.messages(TOPIC).len() >= 5).await;
        shutdown.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.reader.events_filtered, 5);
        assert_eq!(published_tokens(&bus), vec![2, 4, 6, 8, 10]);
        assert_eq!(harness.token(), Some(ResumeToken::new(10)));
    }
}

mod reconnect_tests {
    use super::*;

    #[tokio::test]
    async fn test_exhausted_reconnects_drain_commit_and_fail() {
        let bus = MemoryBus::new();
        let harness = Harness::new(Arc::new(bus.clone()));
        harness.feed.extend((1..=5).map(|n| event(n, "orders")));

        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(""), &shutdown);
        wait_until("publishes", || bus.messages(TOPIC).len() >= 5).await;

        harness.feed.fail_opens(100);
        harness.feed.disconnect_next(1);

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Reader {
                source: ReaderError::ReconnectsExhausted { attempts: 3, .. }
            }
        ));
        assert_eq!(harness.token(), Some(ResumeToken::new(5)));
    }

    #[tokio::test]
    async fn test_transient_disconnects_lose_nothing() {
        let bus = MemoryBus::new();
        let harness = Harness::new(Arc::new(bus.clone()));
        harness.feed.extend((1..=10).map(|n| event(n, "orders")));
        harness.feed.disconnect_next(2);

        let shutdown = CancellationToken::new();
        let run = harness.spawn(config(""), &shutdown);
        wait_until("publishes", || bus.messages(TOPIC).len() >= 10).await;
        shutdown.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.reader.reconnects, 2);
        assert_eq!(published_tokens(&bus), (1..=10).collect::<Vec<_>>());
    }
}
