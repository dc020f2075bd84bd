//! Poll-process-sleep loop shared by bus consumers.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationDuration, IterationResultType};
use crate::topology::random_jitter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Work was done; poll again without sleeping.
    ProcessedItems,
    NoItems,
    Shutdown,
}

#[async_trait]
pub trait PollingProcessor {
    type State: Send;
    type Error: std::error::Error + Send;

    /// Fetch the next batch of work, or `None` if there is nothing to do.
    ///
    /// `cold_start` is true on the first iteration only.
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;

    /// Called once after the loop exits, on shutdown or error.
    async fn finish(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Drive `processor` until `shutdown` fires.
///
/// The loop sleeps `poll_interval` plus up to `poll_jitter_secs` of jitter
/// after an empty iteration. A busy processor is polled back to back.
/// A shutdown arriving mid-iteration lets the current `process` call finish
/// so acknowledged work is never lost.
pub async fn run_polling_loop<P: PollingProcessor + Send>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: CancellationToken,
    name: &str,
    service: &'static str,
) -> Result<(), P::Error> {
    let result = polling_loop(
        processor,
        poll_interval,
        poll_jitter_secs,
        &shutdown,
        name,
        service,
    )
    .await;
    let finished = processor.finish().await;
    result.and(finished)
}

async fn polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: &CancellationToken,
    name: &str,
    service: &'static str,
) -> Result<(), P::Error> {
    let mut first_iteration = true;

    loop {
        let iteration_start = Instant::now();
        let state = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = name, "Shutdown requested while polling");
                return Ok(());
            }

            result = processor.prepare(first_iteration) => result?,
        };
        first_iteration = false;

        let result = match state {
            Some(state) => processor.process(state).await?,
            None => IterationResult::NoItems,
        };

        let result_type = match result {
            IterationResult::Shutdown => {
                emit!(IterationCompleted {
                    service,
                    result: IterationResultType::Shutdown,
                    target: name.to_string(),
                });
                break;
            }
            IterationResult::NoItems => IterationResultType::Empty,
            IterationResult::ProcessedItems => IterationResultType::Processed,
        };
        emit!(IterationCompleted {
            service,
            result: result_type,
            target: name.to_string(),
        });
        emit!(IterationDuration {
            service,
            duration: iteration_start.elapsed(),
            target: name.to_string(),
        });

        if shutdown.is_cancelled() {
            info!(target = name, "Shutdown requested after iteration");
            break;
        }

        if result == IterationResult::ProcessedItems {
            continue;
        }

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        debug!(
            target = name,
            "No new items, waiting {}ms before next poll",
            sleep_duration.as_millis()
        );
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(display("boom"))]
    struct Boom;

    struct Countdown {
        remaining: usize,
        prepared: usize,
        cold_starts: usize,
        finished: bool,
        fail: bool,
    }

    impl Countdown {
        fn new(remaining: usize) -> Self {
            Self {
                remaining,
                prepared: 0,
                cold_starts: 0,
                finished: false,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl PollingProcessor for Countdown {
        type State = usize;
        type Error = Boom;

        async fn prepare(&mut self, cold_start: bool) -> Result<Option<usize>, Boom> {
            self.prepared += 1;
            if cold_start {
                self.cold_starts += 1;
            }
            if self.fail {
                return Err(Boom);
            }
            Ok((self.remaining > 0).then_some(self.remaining))
        }

        async fn process(&mut self, _state: usize) -> Result<IterationResult, Boom> {
            self.remaining -= 1;
            if self.remaining == 0 {
                Ok(IterationResult::Shutdown)
            } else {
                Ok(IterationResult::ProcessedItems)
            }
        }

        async fn finish(&mut self) -> Result<(), Boom> {
            self.finished = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_busy_processor_is_polled_back_to_back() {
        let mut processor = Countdown::new(3);
        run_polling_loop(
            &mut processor,
            Duration::from_secs(3600),
            0,
            CancellationToken::new(),
            "test",
            "puffin",
        )
        .await
        .unwrap();

        assert_eq!(processor.prepared, 3);
        assert_eq!(processor.cold_starts, 1);
        assert!(processor.finished);
    }

    #[tokio::test]
    async fn test_cancelled_loop_still_finishes() {
        let mut processor = Countdown::new(0);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        run_polling_loop(
            &mut processor,
            Duration::from_millis(10),
            0,
            shutdown,
            "test",
            "puffin",
        )
        .await
        .unwrap();
        assert!(processor.finished);
    }

    #[tokio::test]
    async fn test_prepare_error_propagates() {
        let mut processor = Countdown::new(1);
        processor.fail = true;
        let result = run_polling_loop(
            &mut processor,
            Duration::from_millis(10),
            0,
            CancellationToken::new(),
            "test",
            "puffin",
        )
        .await;
        assert!(result.is_err());
        assert!(processor.finished);
    }
}
