//! Collection registry with hot reload.
//!
//! Readers take an `Arc<RegistrySnapshot>` and keep using it for the whole
//! message; a reload builds a complete new snapshot off to the side and swaps
//! the pointer. A snapshot is never modified after it is built.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use freshet_core::config::is_yaml_file;
use freshet_core::emit;
use freshet_core::metrics::events::{RegistryReloadFailed, RegistryReloaded};
use indexmap::IndexMap;
use parking_lot::RwLock;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{
    DuplicateCollectionSnafu, MappingError, ParseDefinitionsSnafu, ReadDefinitionsSnafu,
};
use crate::mapping::{CollectionDefinition, FieldMapping};

use super::CollectionSchema;

/// Definitions keyed by collection name, in load order.
pub type CollectionDefinitions = IndexMap<String, CollectionDefinition>;

/// A collection's schema together with its paired mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredCollection {
    pub schema: CollectionSchema,
    pub mapping: FieldMapping,
}

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    collections: HashMap<String, Arc<RegisteredCollection>>,
    definitions: CollectionDefinitions,
}

impl RegistrySnapshot {
    /// Compile every definition. Any invalid collection rejects the whole set.
    pub fn build(generation: u64, definitions: CollectionDefinitions) -> Result<Self, MappingError> {
        let mut collections = HashMap::with_capacity(definitions.len());
        let mut errors = Vec::new();

        for (name, definition) in &definitions {
            match definition.compile(name) {
                Ok((schema, mapping)) => {
                    collections.insert(name.clone(), Arc::new(RegisteredCollection { schema, mapping }));
                }
                Err(e) => errors.push(e),
            }
        }

        match errors.len() {
            0 => Ok(Self {
                generation,
                collections,
                definitions,
            }),
            1 => Err(errors.remove(0)),
            _ => Err(MappingError::InvalidDefinitions {
                errors: errors.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Exact-name lookup. `None` means the collection is not routed.
    pub fn get(&self, collection: &str) -> Option<&Arc<RegisteredCollection>> {
        self.collections.get(collection)
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

/// Where definitions are read from: a directory of YAML files, plus
/// definitions given inline in the consumer config.
#[derive(Debug, Clone, Default)]
pub struct RegistrySource {
    pub dir: Option<PathBuf>,
    pub inline: CollectionDefinitions,
}

impl RegistrySource {
    pub fn inline(definitions: CollectionDefinitions) -> Self {
        Self {
            dir: None,
            inline: definitions,
        }
    }

    pub fn load(&self) -> Result<CollectionDefinitions, MappingError> {
        let mut definitions = self.inline.clone();
        let Some(dir) = &self.dir else {
            return Ok(definitions);
        };

        for file in definition_files(dir)? {
            let contents = std::fs::read_to_string(&file).context(ReadDefinitionsSnafu {
                path: file.clone(),
            })?;
            let parsed: CollectionDefinitions = serde_yaml::from_str(&contents)
                .context(ParseDefinitionsSnafu { path: file.clone() })?;
            for (name, definition) in parsed {
                if definitions.contains_key(&name) {
                    return DuplicateCollectionSnafu {
                        collection: name,
                        origin: file.display().to_string(),
                    }
                    .fail();
                }
                definitions.insert(name, definition);
            }
        }
        Ok(definitions)
    }
}

fn definition_files(dir: &Path) -> Result<Vec<PathBuf>, MappingError> {
    let entries = std::fs::read_dir(dir).context(ReadDefinitionsSnafu {
        path: dir.to_path_buf(),
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Holder of the active snapshot.
pub struct SchemaRegistry {
    source: RegistrySource,
    current: RwLock<Arc<RegistrySnapshot>>,
    target: String,
}

impl SchemaRegistry {
    /// Load generation 1. Fails if the initial definitions are invalid.
    pub fn load(source: RegistrySource, target: impl Into<String>) -> Result<Self, MappingError> {
        let target = target.into();
        let snapshot = RegistrySnapshot::build(1, source.load()?)?;
        info!(
            target = %target,
            "[registry] Loaded {} collection(s)",
            snapshot.len()
        );
        emit!(RegistryReloaded {
            generation: 1,
            collections: snapshot.len(),
            target: target.clone(),
        });
        Ok(Self {
            source,
            current: RwLock::new(Arc::new(snapshot)),
            target,
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Re-read the source and swap in a new snapshot if anything changed.
    ///
    /// Returns the new generation, or `None` when the definitions are
    /// unchanged. On error the active snapshot is left as it was.
    pub fn reload(&self) -> Result<Option<u64>, MappingError> {
        let definitions = self.source.load()?;
        let current = self.snapshot();
        if current.definitions == definitions {
            return Ok(None);
        }

        let generation = current.generation + 1;
        let snapshot = RegistrySnapshot::build(generation, definitions)?;
        let collections = snapshot.len();
        *self.current.write() = Arc::new(snapshot);

        emit!(RegistryReloaded {
            generation,
            collections,
            target: self.target.clone(),
        });
        Ok(Some(generation))
    }

    /// Reload every `interval` until `shutdown` fires.
    pub async fn run_reloads(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        while shutdown.run_until_cancelled(ticker.tick()).await.is_some() {
            match self.reload() {
                Ok(Some(generation)) => info!(
                    target = %self.target,
                    "[registry] Activated generation {generation}"
                ),
                Ok(None) => debug!(target = %self.target, "[registry] Definitions unchanged"),
                Err(e) => {
                    warn!(
                        target = %self.target,
                        "[registry] Reload rejected, keeping generation {}: {e}",
                        self.snapshot().generation()
                    );
                    emit!(RegistryReloadFailed {
                        target: self.target.clone(),
                    });
                }
            }
        }
    }
}
