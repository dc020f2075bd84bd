//! Poll a subscription, route each message, then acknowledge the batch.

use std::sync::Arc;

use async_trait::async_trait;
use freshet_core::bus::{BusMessage, Subscription};
use freshet_core::emit;
use freshet_core::metrics::events::MessagesPolled;
use freshet_core::{IterationResult, PollingProcessor};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::router::{Router, RouterStats};

pub struct ConsumerProcessor {
    subscription: Box<dyn Subscription>,
    router: Router,
    batch_size: usize,
    global_permits: Option<Arc<Semaphore>>,
    target: String,
}

impl ConsumerProcessor {
    pub fn new(
        subscription: Box<dyn Subscription>,
        router: Router,
        batch_size: usize,
        target: impl Into<String>,
    ) -> Self {
        Self {
            subscription,
            router,
            batch_size,
            global_permits: None,
            target: target.into(),
        }
    }

    pub fn with_global_permits(mut self, permits: Option<Arc<Semaphore>>) -> Self {
        self.global_permits = permits;
        self
    }

    pub fn stats(&self) -> RouterStats {
        self.router.stats()
    }
}

#[async_trait]
impl PollingProcessor for ConsumerProcessor {
    type State = Vec<BusMessage>;
    type Error = PipelineError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error> {
        if cold_start {
            debug!(target = %self.target, "[consume] First poll");
        }
        let batch = self.subscription.poll(self.batch_size).await?;
        if batch.is_empty() {
            return Ok(None);
        }
        emit!(MessagesPolled {
            count: batch.len() as u64,
            target: self.target.clone(),
        });
        Ok(Some(batch))
    }

    /// Messages are only acknowledged once every one of them is written or
    /// dead-lettered and the dead letters are flushed.
    async fn process(&mut self, batch: Self::State) -> Result<IterationResult, Self::Error> {
        let before = self.router.stats();

        for message in &batch {
            let _permit = match &self.global_permits {
                Some(permits) => permits.clone().acquire_owned().await.ok(),
                None => None,
            };
            match self.router.route(message).await {
                Ok(_) => {}
                Err(PipelineError::Interrupted) => {
                    info!(
                        target = %self.target,
                        "[consume] Shutdown during write retries, batch left unacknowledged"
                    );
                    return Ok(IterationResult::Shutdown);
                }
                Err(e) => return Err(e),
            }
        }

        self.router.dlq().flush().await?;
        self.subscription.commit().await?;

        let after = self.router.stats();
        debug!(
            target = %self.target,
            messages = batch.len(),
            raw = after.raw_written - before.raw_written,
            typed = after.records_written - before.records_written,
            skipped = after.skipped - before.skipped,
            dead_lettered = after.dead_lettered - before.dead_lettered,
            "[consume] Batch acknowledged"
        );
        Ok(IterationResult::ProcessedItems)
    }

    async fn finish(&mut self) -> Result<(), Self::Error> {
        self.router.dlq().flush().await?;
        let stats = self.router.stats();
        info!(
            target = %self.target,
            messages = stats.messages,
            raw = stats.raw_written,
            typed = stats.records_written,
            skipped = stats.skipped,
            dead_lettered = stats.dead_lettered,
            "[consume] Consumer stopped"
        );
        Ok(())
    }
}
