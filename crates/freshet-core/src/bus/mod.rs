//! Message bus between the ingester and its consumers.
//!
//! Publishers tag each message with an ordering key. Messages sharing a key
//! are delivered in publish order. Every subscription sees every message of
//! its topic, so the raw and typed paths consume independently.

mod memory;
mod storage;

pub use memory::{MemoryBus, MemorySubscription};
pub use storage::{
    StorageBus, StorageBusConfig, StorageSubscription, SubscriptionState,
    WatermarkState,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::BusError;

/// A message as seen by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Unique per topic, stable across redeliveries.
    pub id: String,
    pub topic: String,
    pub ordering_key: String,
    pub payload: Bytes,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish and return the message id once the bus has accepted it.
    async fn publish(&self, topic: &str, payload: Bytes, ordering_key: &str)
    -> Result<String, BusError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Up to `max` messages following the last one returned.
    async fn poll(&mut self, max: usize) -> Result<Vec<BusMessage>, BusError>;

    /// Acknowledge everything returned so far. Unacknowledged messages are
    /// redelivered to a new subscription with the same name.
    async fn commit(&mut self) -> Result<(), BusError>;
}
