//! Identifier of a bus consumer.

use freshet_core::ComponentKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names the consumer in logs, metric labels and, by default, its bus
/// subscription.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerKey(ComponentKey);

impl ConsumerKey {
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

impl fmt::Display for ConsumerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ConsumerKey {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}
