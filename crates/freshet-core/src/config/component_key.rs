//! Identifier for a configured component.
//!
//! Specialized as `PipelineKey` in freshet and `ConsumerKey` in puffin. Keys
//! end up in checkpoint object names and metric labels, so they are limited
//! to a path-safe character set.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKey(String);

impl ComponentKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// True when the key is non-empty and only uses `[A-Za-z0-9_.-]`.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && self.0 != "."
            && self.0 != ".."
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ComponentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
