//! Object-store spool bus.
//!
//! Each message is one object at `{topic}/{millis:013}-{seq:010}-{key}.json`
//! holding the raw payload. Names sort in publish order. A subscription keeps
//! a watermark (the last acknowledged object) at
//! `_subscriptions/{name}/{topic}.json` and lists objects above it.
//!
//! A publish that started earlier can land after a later one. Subscribers
//! therefore ignore objects younger than `settle_ms`, which must exceed the
//! publisher's timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, info, warn};

use super::{BusMessage, MessageBus, Subscription};
use crate::error::{BusError, BusStorageSnafu};
use crate::storage::StorageProviderRef;

const SUBSCRIPTION_DIR: &str = "_subscriptions";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageBusConfig {
    /// Root URL of the spool.
    pub path: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub storage_options: std::collections::HashMap<String, String>,
    /// Minimum object age before a subscriber reads it.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_topic() -> String {
    "cdc-events".to_string()
}

fn default_settle_ms() -> u64 {
    10_000
}

pub struct StorageBus {
    storage: StorageProviderRef,
    sequence: AtomicU64,
}

impl StorageBus {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self {
            storage,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, name: &str, topic: &str, settle_ms: u64) -> StorageSubscription {
        StorageSubscription::new(self.storage.clone(), name, topic, settle_ms)
    }

    fn object_name(&self, topic: &str, ordering_key: &str) -> Path {
        let millis = Utc::now().timestamp_millis();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) % 10_000_000_000;
        let key: String = ordering_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        Path::from(format!("{topic}/{millis:013}-{seq:010}-{key}.json"))
    }
}

#[async_trait]
impl MessageBus for StorageBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        ordering_key: &str,
    ) -> Result<String, BusError> {
        let path = self.object_name(topic, ordering_key);
        self.storage
            .put(path.clone(), payload)
            .await
            .context(BusStorageSnafu)?;
        Ok(message_id(&path))
    }
}

/// Where a subscription stands, persisted after each commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value")]
pub enum WatermarkState {
    /// Nothing acknowledged yet.
    #[default]
    Initial,
    /// Last acknowledged object, more were seen recently.
    Active(String),
    /// Last acknowledged object, the last poll found nothing newer.
    Idle(String),
}

impl WatermarkState {
    pub fn path(&self) -> Option<&str> {
        match self {
            WatermarkState::Initial => None,
            WatermarkState::Active(path) | WatermarkState::Idle(path) => Some(path),
        }
    }

    fn mark_idle(&mut self) -> bool {
        match self {
            WatermarkState::Active(path) => {
                *self = WatermarkState::Idle(std::mem::take(path));
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub watermark: WatermarkState,
    #[serde(default)]
    pub last_update_ts: i64,
}

fn default_schema_version() -> u32 {
    1
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            watermark: WatermarkState::Initial,
            last_update_ts: 0,
        }
    }
}

pub struct StorageSubscription {
    storage: StorageProviderRef,
    name: String,
    topic: String,
    settle_ms: u64,
    state: SubscriptionState,
    loaded: bool,
    /// Last object handed out by `poll`, acknowledged on `commit`.
    delivered: Option<String>,
    dirty: bool,
}

impl StorageSubscription {
    fn new(storage: StorageProviderRef, name: &str, topic: &str, settle_ms: u64) -> Self {
        Self {
            storage,
            name: name.to_string(),
            topic: topic.to_string(),
            settle_ms,
            state: SubscriptionState::default(),
            loaded: false,
            delivered: None,
            dirty: false,
        }
    }

    fn state_path(&self) -> Path {
        Path::from(format!("{SUBSCRIPTION_DIR}/{}/{}.json", self.name, self.topic))
    }

    pub fn state(&self) -> &SubscriptionState {
        &self.state
    }

    async fn load(&mut self) -> Result<(), BusError> {
        if self.loaded {
            return Ok(());
        }
        match self.storage.get(self.state_path()).await {
            Ok(bytes) => match serde_json::from_slice::<SubscriptionState>(&bytes) {
                Ok(state) => {
                    info!(
                        subscription = %self.name,
                        topic = %self.topic,
                        watermark = ?state.watermark,
                        "Loaded subscription watermark"
                    );
                    self.state = state;
                }
                Err(e) => {
                    warn!(
                        subscription = %self.name,
                        error = %e,
                        "Failed to parse subscription state, starting from the beginning"
                    );
                }
            },
            Err(e) if e.is_not_found() => {
                debug!(subscription = %self.name, "No subscription state, starting fresh");
            }
            Err(source) => return Err(BusError::BusStorage { source }),
        }
        self.loaded = true;
        Ok(())
    }

    fn is_settled(&self, path: &Path, now: DateTime<Utc>) -> bool {
        published_at(path)
            .map(|at| (now - at).num_milliseconds() >= self.settle_ms as i64)
            .unwrap_or(true)
    }
}

#[async_trait]
impl Subscription for StorageSubscription {
    async fn poll(&mut self, max: usize) -> Result<Vec<BusMessage>, BusError> {
        self.load().await?;

        let offset = self
            .delivered
            .clone()
            .or_else(|| self.state.watermark.path().map(str::to_string));
        let listed = match &offset {
            Some(offset) => {
                self.storage
                    .list_after(&self.topic, &Path::from(offset.as_str()))
                    .await
            }
            None => self.storage.list_with_prefix(&self.topic).await,
        }
        .context(BusStorageSnafu)?;

        let now = Utc::now();
        let mut messages = Vec::new();
        for path in listed {
            if messages.len() >= max || !self.is_settled(&path, now) {
                break;
            }
            let payload = self
                .storage
                .get(path.clone())
                .await
                .context(BusStorageSnafu)?;
            messages.push(BusMessage {
                id: message_id(&path),
                topic: self.topic.clone(),
                ordering_key: ordering_key(&path),
                payload,
                published_at: published_at(&path).unwrap_or(now),
            });
            self.delivered = Some(path.to_string());
        }

        if messages.is_empty() && self.delivered.is_none() {
            self.dirty |= self.state.watermark.mark_idle();
        }
        Ok(messages)
    }

    async fn commit(&mut self) -> Result<(), BusError> {
        if let Some(path) = self.delivered.take() {
            self.state.watermark = WatermarkState::Active(path);
            self.dirty = true;
        }
        if !self.dirty {
            return Ok(());
        }

        self.state.last_update_ts = Utc::now().timestamp();
        let json = serde_json::to_vec_pretty(&self.state).map_err(|e| BusError::MalformedMessage {
            id: self.state_path().to_string(),
            source: e,
        })?;
        self.storage
            .atomic_write(&self.state_path(), json)
            .await
            .context(BusStorageSnafu)?;
        self.dirty = false;
        Ok(())
    }
}

fn file_stem(path: &Path) -> &str {
    let name = path.filename().unwrap_or_default();
    name.strip_suffix(".json").unwrap_or(name)
}

fn message_id(path: &Path) -> String {
    file_stem(path).to_string()
}

fn ordering_key(path: &Path) -> String {
    file_stem(path).splitn(3, '-').nth(2).unwrap_or_default().to_string()
}

fn published_at(path: &Path) -> Option<DateTime<Utc>> {
    let millis: i64 = file_stem(path).split('-').next()?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}
