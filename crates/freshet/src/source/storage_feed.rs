//! Replays change records exported as NDJSON objects.
//!
//! Each line is one change `{token, collection, operation, document,
//! timestamp}`. Objects are immutable once written and are read in path
//! order, so an exporter must name them so that later changes sort later.

use std::collections::VecDeque;

use async_trait::async_trait;
use object_store::path::Path;
use snafu::ResultExt;
use tracing::{debug, warn};

use freshet_core::{ChangeEvent, ResumeToken, StorageProviderRef};

use super::{ChangeFeed, ChangeStream};
use crate::error::{FeedError, FeedStorageSnafu};

pub struct StorageFeed {
    storage: StorageProviderRef,
    prefix: String,
}

impl StorageFeed {
    pub fn new(storage: StorageProviderRef, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ChangeFeed for StorageFeed {
    async fn open(&self, from: Option<ResumeToken>) -> Result<Box<dyn ChangeStream>, FeedError> {
        debug!(from = ?from, prefix = %self.prefix, "Opening storage change feed");
        Ok(Box::new(StorageStream {
            storage: self.storage.clone(),
            prefix: self.prefix.clone(),
            after: from,
            current_file: None,
            pending: VecDeque::new(),
        }))
    }
}

struct StorageStream {
    storage: StorageProviderRef,
    prefix: String,
    after: Option<ResumeToken>,
    current_file: Option<Path>,
    pending: VecDeque<ChangeEvent>,
}

impl StorageStream {
    /// Load the next object into `pending`. Returns false if there is none.
    async fn load_next_file(&mut self) -> Result<bool, FeedError> {
        let listed = match &self.current_file {
            Some(current) => self.storage.list_after(&self.prefix, current).await,
            None => self.storage.list_with_prefix(&self.prefix).await,
        }
        .context(FeedStorageSnafu)?;

        let Some(file) = listed.into_iter().find(|path| is_change_file(path)) else {
            return Ok(false);
        };

        let bytes = self
            .storage
            .get(file.clone())
            .await
            .context(FeedStorageSnafu)?;
        let text = String::from_utf8_lossy(&bytes);

        for (line_number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChangeEvent>(line) {
                Ok(event) if Some(event.token) > self.after => self.pending.push_back(event),
                Ok(_) => {}
                Err(e) => warn!(
                    file = %file,
                    line = line_number + 1,
                    error = %e,
                    "Skipping malformed change record"
                ),
            }
        }

        self.current_file = Some(file);
        Ok(true)
    }
}

#[async_trait]
impl ChangeStream for StorageStream {
    async fn next(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                // Records may repeat across overlapping exports.
                if Some(event.token) <= self.after {
                    continue;
                }
                self.after = Some(event.token);
                return Ok(Some(event));
            }
            if !self.load_next_file().await? {
                return Ok(None);
            }
        }
    }
}

fn is_change_file(path: &Path) -> bool {
    matches!(path.extension(), Some("ndjson" | "jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_core::StorageProvider;
    use std::sync::Arc;

    fn line(token: u64, collection: &str) -> String {
        format!(
            r#"{{"token":{token},"collection":"{collection}","operation":"insert","document":{{"_id":"{token}"}},"timestamp":"2024-06-01T00:00:00Z"}}"#
        )
    }

    async fn write(storage: &StorageProvider, name: &str, lines: &[String]) {
        storage
            .put(name, format!("{}\n", lines.join("\n")))
            .await
            .unwrap();
    }

    async fn drain(stream: &mut Box<dyn ChangeStream>) -> Vec<u64> {
        let mut tokens = Vec::new();
        while let Some(event) = stream.next().await.unwrap() {
            tokens.push(event.token.position());
        }
        tokens
    }

    #[tokio::test]
    async fn test_reads_files_in_order_and_tails_new_ones() {
        let storage = Arc::new(StorageProvider::in_memory());
        write(&storage, "changes/0001.ndjson", &[line(1, "a"), line(2, "b")]).await;
        write(&storage, "changes/0002.ndjson", &[line(3, "a")]).await;
        storage.put("changes/README.txt", "ignored").await.unwrap();

        let feed = StorageFeed::new(storage.clone(), "changes");
        let mut stream = feed.open(None).await.unwrap();
        assert_eq!(drain(&mut stream).await, vec![1, 2, 3]);

        write(&storage, "changes/0003.ndjson", &[line(4, "b")]).await;
        assert_eq!(drain(&mut stream).await, vec![4]);
    }

    #[tokio::test]
    async fn test_resume_skips_seen_tokens_and_bad_lines() {
        let storage = Arc::new(StorageProvider::in_memory());
        write(
            &storage,
            "changes/0001.ndjson",
            &[line(1, "a"), "{not json".to_string(), line(2, "a"), line(3, "a")],
        )
        .await;

        let feed = StorageFeed::new(storage, "changes");
        let mut stream = feed.open(Some(ResumeToken::new(1))).await.unwrap();
        assert_eq!(drain(&mut stream).await, vec![2, 3]);
    }
}
