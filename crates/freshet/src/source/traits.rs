//! The seam between the reader and whatever produces change events.

use async_trait::async_trait;
use freshet_core::{ChangeEvent, ResumeToken};

use crate::error::FeedError;

/// A resumable, ordered source of change events.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a cursor positioned strictly after `from`, or at the start.
    async fn open(&self, from: Option<ResumeToken>) -> Result<Box<dyn ChangeStream>, FeedError>;
}

#[async_trait]
pub trait ChangeStream: Send {
    /// The next event, or `None` if nothing is available yet.
    ///
    /// Tokens returned by one stream are strictly increasing.
    async fn next(&mut self) -> Result<Option<ChangeEvent>, FeedError>;
}
