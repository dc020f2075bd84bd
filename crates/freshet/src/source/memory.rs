//! Scripted in-process feed.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use freshet_core::{ChangeEvent, ResumeToken};

use super::{ChangeFeed, ChangeStream};
use crate::error::FeedError;

#[derive(Default)]
struct Inner {
    events: Vec<ChangeEvent>,
    /// Upcoming `next` calls that fail with a disconnect.
    disconnects: usize,
    /// Upcoming `open` calls that fail.
    failed_opens: usize,
    stalled: bool,
    opens: Vec<Option<ResumeToken>>,
}

/// Events pushed by a test, served in token order.
///
/// Clones share state, so a test can keep a handle to push events, inject
/// disconnects or stall reads while the reader owns another.
#[derive(Clone, Default)]
pub struct MemoryFeed {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = ChangeEvent>) -> Self {
        let feed = Self::new();
        feed.extend(events);
        feed
    }

    pub fn push(&self, event: ChangeEvent) {
        self.extend([event]);
    }

    pub fn extend(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        let mut inner = self.inner.lock();
        inner.events.extend(events);
        inner.events.sort_by_key(|event| event.token);
    }

    /// Make the next `count` reads fail as disconnects.
    pub fn disconnect_next(&self, count: usize) {
        self.inner.lock().disconnects += count;
    }

    /// Make the next `count` opens fail.
    pub fn fail_opens(&self, count: usize) {
        self.inner.lock().failed_opens += count;
    }

    /// While stalled, reads never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.lock().stalled = stalled;
    }

    /// The resume position of every successful `open`, in order.
    pub fn opens(&self) -> Vec<Option<ResumeToken>> {
        self.inner.lock().opens.clone()
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn open(&self, from: Option<ResumeToken>) -> Result<Box<dyn ChangeStream>, FeedError> {
        let mut inner = self.inner.lock();
        if inner.failed_opens > 0 {
            inner.failed_opens -= 1;
            return Err(FeedError::Disconnected {
                message: "injected open failure".to_string(),
            });
        }
        inner.opens.push(from);
        Ok(Box::new(MemoryStream {
            inner: self.inner.clone(),
            after: from,
        }))
    }
}

struct MemoryStream {
    inner: Arc<Mutex<Inner>>,
    after: Option<ResumeToken>,
}

#[async_trait]
impl ChangeStream for MemoryStream {
    async fn next(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        let next = {
            let mut inner = self.inner.lock();
            if inner.stalled {
                None
            } else if inner.disconnects > 0 {
                inner.disconnects -= 1;
                return Err(FeedError::Disconnected {
                    message: "injected disconnect".to_string(),
                });
            } else {
                Some(
                    inner
                        .events
                        .iter()
                        .find(|event| Some(event.token) > self.after)
                        .cloned(),
                )
            }
        };

        match next {
            None => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            Some(event) => {
                if let Some(event) = &event {
                    self.after = Some(event.token);
                }
                Ok(event)
            }
        }
    }
}
