//! Durable key to resume-token map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use object_store::path::Path;
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use freshet_core::emit;
use freshet_core::metrics::events::StaleCheckpoint;
use freshet_core::{ResumeToken, StorageProviderRef};

use super::CHECKPOINT_DIR;
use super::state::CheckpointRecord;
use crate::error::{CheckpointError, CheckpointSerializeSnafu, CheckpointStorageSnafu};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ResumeToken>, CheckpointError>;

    /// Persist `token` for `key`. Tokens only move forward.
    async fn put(&self, key: &str, token: ResumeToken) -> Result<(), CheckpointError>;
}

/// Checkpoints as JSON objects written with temp-file-and-rename.
pub struct StorageCheckpointStore {
    storage: StorageProviderRef,
    staleness: Duration,
    /// Last record read or written per key, so counters carry across saves.
    records: Mutex<HashMap<String, CheckpointRecord>>,
}

impl StorageCheckpointStore {
    pub fn new(storage: StorageProviderRef, staleness: Duration) -> Self {
        Self {
            storage,
            staleness,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn path(key: &str) -> Path {
        Path::from(format!("{CHECKPOINT_DIR}/{key}_checkpoint.json"))
    }

    /// The full record for `key`, if one has been saved.
    pub async fn load(&self, key: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let bytes = match self.storage.get(Self::path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                debug!(target = %key, "No checkpoint found, starting from the beginning");
                return Ok(None);
            }
            Err(source) => return Err(CheckpointError::CheckpointStorage { source }),
        };

        match serde_json::from_slice::<CheckpointRecord>(&bytes) {
            Ok(record) => {
                self.records.lock().insert(key.to_string(), record.clone());
                Ok(Some(record))
            }
            Err(e) => {
                warn!(
                    target = %key,
                    error = %e,
                    "Failed to parse checkpoint JSON, starting from the beginning"
                );
                Ok(None)
            }
        }
    }

    fn check_staleness(&self, key: &str, record: &CheckpointRecord) {
        let Some(age) = record.age(Utc::now()) else {
            return;
        };
        let Ok(age) = age.to_std() else {
            return;
        };
        if age > self.staleness {
            warn!(
                target = %key,
                age_hours = age.as_secs() / 3600,
                token = ?record.token,
                "Checkpoint is older than the source history window, the token may no longer be valid"
            );
            emit!(StaleCheckpoint {
                age,
                target: key.to_string(),
            });
        }
    }
}

#[async_trait]
impl CheckpointStore for StorageCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<ResumeToken>, CheckpointError> {
        let Some(record) = self.load(key).await? else {
            return Ok(None);
        };
        info!(
            target = %key,
            token = ?record.token,
            save_count = record.save_count,
            last_update_ts = record.last_update_ts,
            "Loaded checkpoint"
        );
        self.check_staleness(key, &record);
        Ok(record.token.token())
    }

    async fn put(&self, key: &str, token: ResumeToken) -> Result<(), CheckpointError> {
        let record = {
            let records = self.records.lock();
            let mut record = records.get(key).cloned().unwrap_or_default();
            record
                .metadata
                .insert("pipeline".to_string(), key.to_string());
            record.advance(token, Utc::now());
            record
        };

        let json = serde_json::to_vec_pretty(&record).context(CheckpointSerializeSnafu)?;
        self.storage
            .atomic_write(&Self::path(key), json)
            .await
            .context(CheckpointStorageSnafu)?;

        self.records.lock().insert(key.to_string(), record);
        Ok(())
    }
}

/// In-memory store with an injectable failure switch.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    tokens: Mutex<HashMap<String, ResumeToken>>,
    failing: AtomicBool,
    puts: AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(key: &str, token: ResumeToken) -> Self {
        let store = Self::new();
        store.tokens.lock().insert(key.to_string(), token);
        store
    }

    /// While failing, every `put` returns an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful puts so far.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn token(&self, key: &str) -> Option<ResumeToken> {
        self.tokens.lock().get(key).copied()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<ResumeToken>, CheckpointError> {
        Ok(self.token(key))
    }

    async fn put(&self, key: &str, token: ResumeToken) -> Result<(), CheckpointError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CheckpointError::CheckpointUnavailable {
                message: "injected failure".to_string(),
            });
        }
        self.tokens.lock().insert(key.to_string(), token);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_core::StorageProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_storage(temp_dir: &TempDir) -> StorageProviderRef {
        Arc::new(
            StorageProvider::for_url_with_options(
                temp_dir.path().to_str().unwrap(),
                HashMap::new(),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_no_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let store = StorageCheckpointStore::new(
            create_test_storage(&temp_dir).await,
            Duration::from_secs(3600),
        );
        assert_eq!(store.get("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_then_get_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let storage = create_test_storage(&temp_dir).await;

        let store = StorageCheckpointStore::new(storage.clone(), Duration::from_secs(3600));
        store.put("orders", ResumeToken::new(100)).await.unwrap();
        store.put("orders", ResumeToken::new(250)).await.unwrap();

        let reopened = StorageCheckpointStore::new(storage, Duration::from_secs(3600));
        assert_eq!(
            reopened.get("orders").await.unwrap(),
            Some(ResumeToken::new(250))
        );
        let record = reopened.load("orders").await.unwrap().unwrap();
        assert_eq!(record.save_count, 2);
        assert_eq!(record.events_since_checkpoint, 150);
        assert_eq!(record.metadata["pipeline"], "orders");

        assert!(temp_dir.path().join("_freshet/orders_checkpoint.json").exists());
        assert!(!temp_dir.path().join("_freshet/orders_checkpoint.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_starts_fresh() {
        let temp_dir = TempDir::new().unwrap();
        let storage = create_test_storage(&temp_dir).await;
        storage
            .put("_freshet/orders_checkpoint.json", "not json")
            .await
            .unwrap();

        let store = StorageCheckpointStore::new(storage, Duration::from_secs(3600));
        assert_eq!(store.get("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_checkpoint_still_resumes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = create_test_storage(&temp_dir).await;
        let old = r#"{"schema_version":1,"token":{"state":"Active","value":7},"last_update_ts":1000}"#;
        storage
            .put("_freshet/orders_checkpoint.json", old)
            .await
            .unwrap();

        let store = StorageCheckpointStore::new(storage, Duration::from_secs(3600));
        assert_eq!(store.get("orders").await.unwrap(), Some(ResumeToken::new(7)));
    }

    #[tokio::test]
    async fn test_memory_store_failure_switch() {
        let store = MemoryCheckpointStore::new();
        store.set_failing(true);
        assert!(store.put("orders", ResumeToken::new(1)).await.is_err());
        assert_eq!(store.puts(), 0);

        store.set_failing(false);
        store.put("orders", ResumeToken::new(1)).await.unwrap();
        assert_eq!(store.token("orders"), Some(ResumeToken::new(1)));
    }
}
