//! Tracks which read events are still in flight.
//!
//! Workers finish out of order, so the committable position is the highest
//! token below which every registered event has been acknowledged. The
//! tracker drains acknowledgements only while they are contiguous from the
//! oldest registration.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use freshet_core::ResumeToken;

struct Inner {
    /// Registered tokens in read order with their acknowledgement flag.
    pending: VecDeque<(ResumeToken, bool)>,
    watermark: Option<ResumeToken>,
    last_registered: Option<ResumeToken>,
    acked_since_commit: u64,
}

pub struct InFlightTracker {
    inner: Mutex<Inner>,
    acked: Notify,
}

impl InFlightTracker {
    /// Start from the last committed token, if any.
    pub fn new(start: Option<ResumeToken>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                watermark: start,
                last_registered: start,
                acked_since_commit: 0,
            }),
            acked: Notify::new(),
        }
    }

    /// Record a token read from the feed. Tokens arrive in increasing order.
    pub fn register(&self, token: ResumeToken) {
        let mut inner = self.inner.lock();
        inner.pending.push_back((token, false));
        inner.last_registered = Some(token);
    }

    /// Mark `token` as fully handled (published or dead-lettered).
    pub fn ack(&self, token: ResumeToken) {
        {
            let mut inner = self.inner.lock();
            let Ok(index) = inner.pending.binary_search_by_key(&token, |(t, _)| *t) else {
                return;
            };
            if inner.pending[index].1 {
                return;
            }
            inner.pending[index].1 = true;
            inner.acked_since_commit += 1;

            while let Some(&(token, true)) = inner.pending.front() {
                inner.pending.pop_front();
                inner.watermark = Some(token);
            }
        }
        self.acked.notify_one();
    }

    /// Highest token with nothing unacknowledged at or before it.
    pub fn watermark(&self) -> Option<ResumeToken> {
        self.inner.lock().watermark
    }

    /// Most recent token handed over by the reader.
    pub fn last_registered(&self) -> Option<ResumeToken> {
        self.inner.lock().last_registered
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().pending.iter().filter(|(_, acked)| !acked).count()
    }

    pub fn acked_since_commit(&self) -> u64 {
        self.inner.lock().acked_since_commit
    }

    /// Reset the acknowledgement counter after a commit attempt.
    pub fn reset_acked(&self) {
        self.inner.lock().acked_since_commit = 0;
    }

    /// Resolves after the next acknowledgement.
    pub async fn acknowledged(&self) {
        self.acked.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(n: u64) -> ResumeToken {
        ResumeToken::new(n)
    }

    #[test]
    fn test_watermark_waits_for_oldest() {
        let tracker = InFlightTracker::new(None);
        for n in 1..=4 {
            tracker.register(token(n));
        }

        tracker.ack(token(2));
        tracker.ack(token(3));
        assert_eq!(tracker.watermark(), None);
        assert_eq!(tracker.in_flight(), 2);

        tracker.ack(token(1));
        assert_eq!(tracker.watermark(), Some(token(3)));

        tracker.ack(token(4));
        assert_eq!(tracker.watermark(), Some(token(4)));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_starts_at_committed_token() {
        let tracker = InFlightTracker::new(Some(token(10)));
        assert_eq!(tracker.watermark(), Some(token(10)));

        tracker.register(token(11));
        tracker.register(token(12));
        tracker.ack(token(12));
        assert_eq!(tracker.watermark(), Some(token(10)));
        assert_eq!(tracker.last_registered(), Some(token(12)));
    }

    #[test]
    fn test_duplicate_and_unknown_acks_are_ignored() {
        let tracker = InFlightTracker::new(None);
        tracker.register(token(1));
        tracker.register(token(2));

        tracker.ack(token(2));
        tracker.ack(token(2));
        tracker.ack(token(99));
        assert_eq!(tracker.acked_since_commit(), 1);

        tracker.reset_acked();
        assert_eq!(tracker.acked_since_commit(), 0);
    }
}
