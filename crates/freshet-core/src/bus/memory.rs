//! In-process bus. Used for embedding and for tests, including fault injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;

use super::{BusMessage, MessageBus, Subscription};
use crate::error::BusError;

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Vec<BusMessage>>>,
    /// Committed offsets per (subscription, topic).
    offsets: Mutex<HashMap<(String, String), usize>>,
    sequence: AtomicU64,
    fail_next: AtomicUsize,
    failing: AtomicBool,
    latency_ms: AtomicU64,
    attempts: AtomicU64,
}

/// Cloning shares the same topics.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` publishes.
    pub fn fail_next(&self, count: usize) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Reject every publish until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every publish by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Publish calls seen so far, failed ones included.
    pub fn publish_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Snapshot of everything published to `topic`.
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        self.inner
            .topics
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribe from the subscription's committed offset (start of topic if new).
    pub fn subscribe(&self, name: &str, topic: &str) -> MemorySubscription {
        let key = (name.to_string(), topic.to_string());
        let committed = self.inner.offsets.lock().get(&key).copied().unwrap_or(0);
        MemorySubscription {
            bus: self.clone(),
            key,
            cursor: committed,
        }
    }

    fn take_failure(&self) -> bool {
        if self.inner.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        ordering_key: &str,
    ) -> Result<String, BusError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);

        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.take_failure() {
            return Err(BusError::PublishRejected {
                topic: topic.to_string(),
                message: "injected failure".to_string(),
            });
        }

        let seq = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let id = format!("{seq:012}");
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(BusMessage {
                id: id.clone(),
                topic: topic.to_string(),
                ordering_key: ordering_key.to_string(),
                payload,
                published_at: Utc::now(),
            });
        Ok(id)
    }
}

pub struct MemorySubscription {
    bus: MemoryBus,
    key: (String, String),
    cursor: usize,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn poll(&mut self, max: usize) -> Result<Vec<BusMessage>, BusError> {
        let topics = self.bus.inner.topics.lock();
        let batch: Vec<BusMessage> = topics
            .get(&self.key.1)
            .map(|log| log.iter().skip(self.cursor).take(max).cloned().collect())
            .unwrap_or_default();
        self.cursor += batch.len();
        Ok(batch)
    }

    async fn commit(&mut self) -> Result<(), BusError> {
        self.bus
            .inner
            .offsets
            .lock()
            .insert(self.key.clone(), self.cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscription_sees_every_message() {
        let bus = MemoryBus::new();
        bus.publish("cdc", Bytes::from_static(b"1"), "customers").await.unwrap();
        bus.publish("cdc", Bytes::from_static(b"2"), "orders").await.unwrap();

        let mut raw = bus.subscribe("raw", "cdc");
        let mut typed = bus.subscribe("typed", "cdc");
        assert_eq!(raw.poll(10).await.unwrap().len(), 2);
        assert_eq!(typed.poll(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_uncommitted_messages_are_redelivered() {
        let bus = MemoryBus::new();
        for i in 0..3 {
            bus.publish("cdc", Bytes::from(vec![i]), "k").await.unwrap();
        }

        let mut sub = bus.subscribe("router", "cdc");
        assert_eq!(sub.poll(2).await.unwrap().len(), 2);
        sub.commit().await.unwrap();
        assert_eq!(sub.poll(2).await.unwrap().len(), 1);

        // Crash before the second commit.
        let mut again = bus.subscribe("router", "cdc");
        let redelivered = again.poll(10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].payload.as_ref(), &[2]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = MemoryBus::new();
        bus.fail_next(2);
        assert!(bus.publish("t", Bytes::new(), "k").await.is_err());
        assert!(bus.publish("t", Bytes::new(), "k").await.is_err());
        assert!(bus.publish("t", Bytes::new(), "k").await.is_ok());
        assert_eq!(bus.publish_attempts(), 3);
        assert_eq!(bus.messages("t").len(), 1);
    }
}
