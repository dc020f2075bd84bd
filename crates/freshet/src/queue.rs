//! Bounded FIFO between the source reader and the publisher workers.
//!
//! `enqueue` waits while the queue is full and never drops. Crossing the high
//! watermark raises a pause signal that the reader checks before each read;
//! draining to the low watermark lowers it.
//!
//! Each dequeued item carries an ordering [`Turn`]. Turns for the same key
//! are chained in dequeue order, so concurrent workers still publish events
//! of one collection in queue order.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;

use parking_lot::Mutex;
use snafu::Snafu;
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::Instant;

use freshet_core::ChangeEvent;
use freshet_core::emit;
use freshet_core::metrics::events::{BackpressureChanged, QueueDepth};

#[derive(Debug, Snafu)]
#[snafu(display("Event queue is closed"))]
pub struct QueueClosed;

/// Permission to publish for one ordering key. Dropping it passes the turn on.
#[derive(Debug)]
pub struct Turn {
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl Turn {
    /// Wait until every earlier item with the same key has released its turn.
    ///
    /// Cancel-safe: a later call keeps waiting for the same predecessor.
    pub async fn wait(&mut self) {
        if let Some(previous) = &mut self.previous {
            // An error means the previous turn was dropped, which is the signal.
            let _ = previous.await;
            self.previous = None;
        }
    }
}

#[derive(Debug)]
pub struct QueueItem {
    pub event: ChangeEvent,
    pub enqueued_at: Instant,
    pub turn: Turn,
}

struct Inner {
    items: VecDeque<(ChangeEvent, Instant)>,
    turns: HashMap<String, oneshot::Receiver<()>>,
    closed: bool,
    paused: bool,
}

pub struct EventQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    pause_at: usize,
    resume_at: usize,
    not_empty: Notify,
    not_full: Notify,
    paused: watch::Sender<bool>,
    target: String,
}

impl EventQueue {
    /// `high_watermark` and `low_watermark` are fractions of `capacity`.
    pub fn new(
        capacity: usize,
        high_watermark: f64,
        low_watermark: f64,
        target: impl Into<String>,
    ) -> Self {
        let capacity = capacity.max(1);
        let pause_at = ((capacity as f64 * high_watermark).ceil() as usize).clamp(1, capacity);
        let resume_at = ((capacity as f64 * low_watermark).floor() as usize).min(pause_at - 1);
        let (paused, _) = watch::channel(false);

        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                turns: HashMap::new(),
                closed: false,
                paused: false,
            }),
            capacity,
            pause_at,
            resume_at,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            paused,
            target: target.into(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Append `event`, waiting while the queue is full.
    pub async fn enqueue(&self, event: ChangeEvent) -> Result<(), QueueClosed> {
        let mut event = Some(event);
        loop {
            let mut notified = pin!(self.not_full.notified());
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(QueueClosed);
                }
                if inner.items.len() < self.capacity
                    && let Some(event) = event.take()
                {
                    inner.items.push_back((event, Instant::now()));
                    let depth = inner.items.len();
                    if !inner.paused && depth >= self.pause_at {
                        inner.paused = true;
                        self.set_paused(true);
                    }
                    drop(inner);

                    self.not_empty.notify_one();
                    self.report_depth(depth);
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Take the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained. Cancel-safe: an
    /// item is only removed when the call completes.
    pub async fn dequeue(&self) -> Option<QueueItem> {
        loop {
            let mut notified = pin!(self.not_empty.notified());
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some((event, enqueued_at)) = inner.items.pop_front() {
                    let (done, next) = oneshot::channel();
                    let previous = inner.turns.insert(event.ordering_key().to_string(), next);

                    let depth = inner.items.len();
                    if inner.paused && depth <= self.resume_at {
                        inner.paused = false;
                        self.set_paused(false);
                    }
                    drop(inner);

                    self.not_full.notify_one();
                    self.report_depth(depth);
                    return Some(QueueItem {
                        event,
                        enqueued_at,
                        turn: Turn {
                            previous,
                            _done: done,
                        },
                    });
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Wait until the pause signal is lowered.
    pub async fn wait_until_resumed(&self) {
        let mut paused = self.paused.subscribe();
        // The sender lives as long as the queue, so this cannot fail.
        let _ = paused.wait_for(|paused| !*paused).await;
    }

    /// Refuse further enqueues and wake every waiter. Queued items can still
    /// be dequeued.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        if inner.paused {
            inner.paused = false;
            self.set_paused(false);
        }
        drop(inner);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
        emit!(BackpressureChanged {
            active: paused,
            target: self.target.clone(),
        });
    }

    fn report_depth(&self, depth: usize) {
        emit!(QueueDepth {
            depth,
            target: self.target.clone(),
        });
    }
}
