//! Identifier of an ingestion pipeline.

use freshet_core::ComponentKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names the pipeline in logs, metric labels and its checkpoint object.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineKey(ComponentKey);

impl PipelineKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(ComponentKey::new(id))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn is_path_safe(&self) -> bool {
        self.0.is_path_safe()
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for PipelineKey {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}
