//! Object storage abstraction over S3, GCS, Azure, local disk and memory.
//!
//! A provider is rooted at the key prefix of its URL. Every path handed to or
//! returned from it is relative to that root.

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

use crate::emit;
use crate::error::{InvalidUrlSnafu, IoSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub type StorageProviderRef = Arc<StorageProvider>;

#[derive(Clone)]
pub struct StorageProvider {
    object_store: Arc<dyn ObjectStore>,
    prefix: Option<Path>,
    canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Build a provider from a URL such as `s3://bucket/prefix`, `gs://…`,
    /// `az://…`, `file:///dir`, `memory://` or a bare local path.
    ///
    /// `options` are passed to the cloud backend (credentials, region, …).
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        if !url.contains("://") {
            return Self::local(url).await;
        }

        let parsed = Url::parse(url).map_err(|e| {
            InvalidUrlSnafu {
                url,
                message: e.to_string(),
            }
            .build()
        })?;

        match parsed.scheme() {
            "file" => Self::local(parsed.path()).await,
            "memory" => Ok(Self::in_memory()),
            _ => {
                let (store, prefix) =
                    object_store::parse_url_opts(&parsed, options).map_err(|e| {
                        InvalidUrlSnafu {
                            url,
                            message: e.to_string(),
                        }
                        .build()
                    })?;
                let prefix = (!prefix.as_ref().is_empty()).then_some(prefix);
                Ok(Self {
                    object_store: Arc::from(store),
                    prefix,
                    canonical_url: url.trim_end_matches('/').to_string(),
                })
            }
        }
    }

    async fn local(path: &str) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(path).await.context(IoSnafu)?;
        let store = LocalFileSystem::new_with_prefix(path).context(ObjectStoreSnafu)?;
        Ok(Self {
            object_store: Arc::new(store),
            prefix: None,
            canonical_url: format!("file://{path}"),
        })
    }

    /// A fresh, empty in-memory store. Nothing is shared between instances.
    pub fn in_memory() -> Self {
        Self {
            object_store: Arc::new(InMemory::new()),
            prefix: None,
            canonical_url: "memory://".to_string(),
        }
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Prepend the provider's root prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match &self.prefix {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    fn relative(&self, path: Path) -> Path {
        match &self.prefix {
            Some(prefix) => path.parts().skip(prefix.parts().count()).collect(),
            None => path,
        }
    }

    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = async {
            self.object_store
                .get(&self.qualify_path(&path))
                .await?
                .bytes()
                .await
        }
        .await;
        record(StorageOperation::Get, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    pub async fn put(&self, path: impl Into<Path>, bytes: impl Into<Bytes>) -> Result<(), StorageError> {
        let path = path.into();
        self.put_payload(&path, PutPayload::from(bytes.into())).await
    }

    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(path), payload)
            .await;
        record(StorageOperation::Put, start, result.is_ok());
        result.map(|_| ()).context(ObjectStoreSnafu)
    }

    /// Write through `{path}.tmp` and rename, so readers never see a partial object.
    pub async fn atomic_write(&self, path: &Path, content: Vec<u8>) -> Result<(), StorageError> {
        let temp = Path::from(format!("{path}.tmp"));
        self.put_payload(&temp, PutPayload::from(Bytes::from(content)))
            .await?;
        self.rename(&temp, path).await
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self
            .object_store
            .rename(&self.qualify_path(from), &self.qualify_path(to))
            .await;
        record(StorageOperation::Rename, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self.object_store.delete(&self.qualify_path(path)).await;
        record(StorageOperation::Delete, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    /// All objects under `prefix`, sorted by path.
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<Path>, StorageError> {
        self.list_inner(prefix, None).await
    }

    /// Objects under `prefix` whose path sorts strictly after `offset`, sorted.
    pub async fn list_after(&self, prefix: &str, offset: &Path) -> Result<Vec<Path>, StorageError> {
        self.list_inner(prefix, Some(offset)).await
    }

    async fn list_inner(
        &self,
        prefix: &str,
        offset: Option<&Path>,
    ) -> Result<Vec<Path>, StorageError> {
        let relative_prefix = Path::from(prefix);
        let full_prefix = self.qualify_path(&relative_prefix);
        let start = Instant::now();

        let stream = match offset {
            Some(offset) => self
                .object_store
                .list_with_offset(Some(&full_prefix), &self.qualify_path(offset)),
            None => self.object_store.list(Some(&full_prefix)),
        };
        let result: Result<Vec<_>, _> = stream.try_collect().await;
        record(StorageOperation::List, start, result.is_ok());

        let mut paths: Vec<Path> = result
            .context(ObjectStoreSnafu)?
            .into_iter()
            .map(|meta| self.relative(meta.location))
            .filter(|path| !path.as_ref().ends_with(".tmp"))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn record(operation: StorageOperation, start: Instant, ok: bool) {
    let status = if ok {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}
