//! Sequential task moving events from the change feed into the queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use freshet_core::emit;
use freshet_core::metrics::events::{EventFiltered, EventReceived, SourceReconnect};
use freshet_core::{ChangeEvent, ResumeToken, RetryPolicy};

use super::{ChangeFeed, ChangeStream};
use crate::config::SourceConfig;
use crate::error::{FeedError, ReaderError};
use crate::queue::EventQueue;
use crate::tracker::InFlightTracker;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub events_read: u64,
    pub events_filtered: u64,
    pub reconnects: u64,
    /// Last token handed to the queue or filtered out.
    pub cursor: Option<ResumeToken>,
}

pub struct SourceReader {
    feed: Arc<dyn ChangeFeed>,
    queue: Arc<EventQueue>,
    tracker: Arc<InFlightTracker>,
    collections: HashSet<String>,
    read_timeout: Duration,
    idle_poll: Duration,
    reconnect: RetryPolicy,
    target: String,
}

impl SourceReader {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        queue: Arc<EventQueue>,
        tracker: Arc<InFlightTracker>,
        config: &SourceConfig,
        target: impl Into<String>,
    ) -> Self {
        Self {
            feed,
            queue,
            tracker,
            collections: config.collections.iter().cloned().collect(),
            read_timeout: config.read_timeout(),
            idle_poll: config.idle_poll(),
            reconnect: config.reconnect.clone(),
            target: target.into(),
        }
    }

    /// Read strictly after `start` until `shutdown` fires or the queue closes.
    ///
    /// Disconnects and read timeouts reopen the feed after the last delivered
    /// token. Running out of reconnect attempts is the only error.
    pub async fn run(
        self,
        start: Option<ResumeToken>,
        shutdown: CancellationToken,
    ) -> Result<ReaderStats, ReaderError> {
        let mut stats = ReaderStats {
            cursor: start,
            ..ReaderStats::default()
        };
        let mut stream: Option<Box<dyn ChangeStream>> = None;
        let mut failures: u32 = 0;

        info!(target = %self.target, from = ?start, "[reader] Starting");

        loop {
            if self.queue.is_paused() {
                debug!(target = %self.target, "[reader] Queue above high watermark, pausing");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = self.queue.wait_until_resumed() => {
                        debug!(target = %self.target, "[reader] Queue drained, resuming");
                    }
                }
            }

            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                read = self.read_next(&mut stream, stats.cursor) => read,
            };

            match read {
                Ok(Some(event)) => {
                    failures = 0;
                    stats.cursor = Some(event.token);
                    if !self.dispatch(event, &mut stats, &shutdown).await {
                        break;
                    }
                }
                Ok(None) => {
                    failures = 0;
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(self.idle_poll))
                        .await
                        .is_none()
                    {
                        break;
                    }
                }
                Err(source) => {
                    stream = None;
                    failures += 1;
                    if !self.reconnect.allows_attempt(failures) {
                        warn!(
                            target = %self.target,
                            attempts = failures - 1,
                            error = %source,
                            "[reader] Giving up on change feed"
                        );
                        return Err(ReaderError::ReconnectsExhausted {
                            attempts: failures - 1,
                            source,
                        });
                    }

                    warn!(
                        target = %self.target,
                        attempt = failures,
                        error = %source,
                        "[reader] Change feed failed, reconnecting"
                    );
                    stats.reconnects += 1;
                    emit!(SourceReconnect {
                        attempt: failures,
                        target: self.target.clone(),
                    });
                    if !self.reconnect.wait(failures, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(
            target = %self.target,
            read = stats.events_read,
            filtered = stats.events_filtered,
            cursor = ?stats.cursor,
            "[reader] Stopped"
        );
        Ok(stats)
    }

    /// Open the stream if needed and read one event, both under the read timeout.
    async fn read_next(
        &self,
        stream: &mut Option<Box<dyn ChangeStream>>,
        cursor: Option<ResumeToken>,
    ) -> Result<Option<ChangeEvent>, FeedError> {
        let timeout_ms = self.read_timeout.as_millis() as u64;

        let active = match stream {
            Some(active) => active,
            None => {
                let opened = tokio::time::timeout(self.read_timeout, self.feed.open(cursor))
                    .await
                    .map_err(|_| FeedError::ReadTimeout { timeout_ms })??;
                debug!(target = %self.target, from = ?cursor, "[reader] Change feed opened");
                stream.insert(opened)
            }
        };

        tokio::time::timeout(self.read_timeout, active.next())
            .await
            .map_err(|_| FeedError::ReadTimeout { timeout_ms })?
    }

    /// Register and enqueue one event. Returns false once the pipeline stops.
    async fn dispatch(
        &self,
        event: ChangeEvent,
        stats: &mut ReaderStats,
        shutdown: &CancellationToken,
    ) -> bool {
        emit!(EventReceived {
            target: self.target.clone(),
        });

        let token = event.token;
        self.tracker.register(token);

        if !self.collections.is_empty() && !self.collections.contains(&event.collection) {
            stats.events_filtered += 1;
            self.tracker.ack(token);
            emit!(EventFiltered {
                target: self.target.clone(),
            });
            return true;
        }

        let enqueued = tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            result = self.queue.enqueue(event) => result.is_ok(),
        };
        if enqueued {
            stats.events_read += 1;
        } else {
            debug!(target = %self.target, token = %token, "[reader] Event not enqueued, stopping");
        }
        enqueued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryFeed;
    use freshet_core::Operation;
    use serde_json::{Map, json};

    fn event(token: u64, collection: &str) -> ChangeEvent {
        let mut document = Map::new();
        document.insert("_id".into(), json!(format!("doc-{token}")));
        ChangeEvent::new(ResumeToken::new(token), collection, Operation::Insert, document)
    }

    fn source_config(collections: &[&str], max_attempts: u32) -> SourceConfig {
        SourceConfig {
            path: "memory://".into(),
            storage_options: Default::default(),
            collections: collections.iter().map(|c| c.to_string()).collect(),
            read_timeout_secs: 5,
            idle_poll_ms: 10,
            reconnect: RetryPolicy::immediate(max_attempts),
        }
    }

    fn reader(
        feed: &MemoryFeed,
        config: &SourceConfig,
        capacity: usize,
    ) -> (SourceReader, Arc<EventQueue>, Arc<InFlightTracker>) {
        let queue = Arc::new(EventQueue::new(capacity, 0.8, 0.5, "test"));
        let tracker = Arc::new(InFlightTracker::new(None));
        let reader = SourceReader::new(
            Arc::new(feed.clone()),
            queue.clone(),
            tracker.clone(),
            config,
            "test",
        );
        (reader, queue, tracker)
    }

    async fn wait_for_len(queue: &EventQueue, len: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_reads_in_order_and_stops_on_shutdown() {
        let feed = MemoryFeed::with_events((1..=5).map(|n| event(n, "orders")));
        let (reader, queue, tracker) = reader(&feed, &source_config(&[], 3), 100);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reader.run(None, shutdown.clone()));

        wait_for_len(&queue, 5).await;
        shutdown.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.events_read, 5);
        assert_eq!(stats.cursor, Some(ResumeToken::new(5)));
        assert_eq!(tracker.in_flight(), 5);
        for n in 1..=5 {
            assert_eq!(queue.dequeue().await.unwrap().event.token, ResumeToken::new(n));
        }
    }

    #[tokio::test]
    async fn test_filtered_events_are_acked_not_enqueued() {
        let feed = MemoryFeed::with_events([
            event(1, "orders"),
            event(2, "audit"),
            event(3, "orders"),
        ]);
        let (reader, queue, tracker) = reader(&feed, &source_config(&["orders"], 3), 100);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reader.run(None, shutdown.clone()));

        wait_for_len(&queue, 2).await;
        shutdown.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.events_filtered, 1);
        assert_eq!(stats.cursor, Some(ResumeToken::new(3)));
        tracker.ack(ResumeToken::new(1));
        assert_eq!(tracker.watermark(), Some(ResumeToken::new(2)));
    }

    #[tokio::test]
    async fn test_reconnects_after_last_delivered_token() {
        let feed = MemoryFeed::with_events((1..=4).map(|n| event(n, "orders")));
        feed.disconnect_next(2);
        let (reader, queue, _) = reader(&feed, &source_config(&[], 5), 100);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reader.run(Some(ResumeToken::new(1)), shutdown.clone()));

        wait_for_len(&queue, 3).await;
        shutdown.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.reconnects, 2);
        assert_eq!(feed.opens().first(), Some(&Some(ResumeToken::new(1))));
        assert_eq!(queue.dequeue().await.unwrap().event.token, ResumeToken::new(2));
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_are_fatal() {
        let feed = MemoryFeed::new();
        feed.fail_opens(10);
        let (reader, _, _) = reader(&feed, &source_config(&[], 3), 100);

        let err = reader.run(None, CancellationToken::new()).await.unwrap_err();
        let ReaderError::ReconnectsExhausted { attempts, .. } = err;
        assert_eq!(attempts, 3);
        assert!(feed.opens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_read_times_out_as_disconnect() {
        let feed = MemoryFeed::with_events([event(1, "orders")]);
        feed.set_stalled(true);
        let (reader, _, _) = reader(&feed, &source_config(&[], 2), 100);

        let err = reader.run(None, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ReaderError::ReconnectsExhausted {
                source: FeedError::ReadTimeout { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pauses_at_high_watermark() {
        let feed = MemoryFeed::with_events((1..=20).map(|n| event(n, "orders")));
        let (reader, queue, _) = reader(&feed, &source_config(&[], 3), 10);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reader.run(None, shutdown.clone()));

        wait_for_len(&queue, 8).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_paused());
        assert_eq!(queue.len(), 8);

        for _ in 0..3 {
            queue.dequeue().await.unwrap();
        }
        assert!(!queue.is_paused());
        wait_for_len(&queue, 8).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
