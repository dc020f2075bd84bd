//! Pipeline orchestration primitives.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use snafu::ResultExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GlobalConfig;
use crate::error::{AddressParseSnafu, MetricsSnafu, PipelineSetupError};
use crate::signal::shutdown_signal;

/// Resources shared by every pipeline in the process.
#[derive(Clone)]
pub struct PipelineContext {
    /// Cross-pipeline limit on concurrent bus and storage operations.
    pub global_semaphore: Option<Arc<Semaphore>>,
    pub poll_jitter_secs: u64,
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    pub fn new(
        total_concurrency: Option<usize>,
        poll_jitter_secs: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            global_semaphore: total_concurrency.map(|n| Arc::new(Semaphore::new(n))),
            poll_jitter_secs,
            shutdown,
        }
    }
}

/// A self-contained unit of work driven by the runner.
pub trait Pipeline: Send + 'static {
    type Key: Clone + Display + Send + 'static;
    type Error: std::error::Error + Send + 'static;

    fn key(&self) -> &Self::Key;

    /// Run until the shared shutdown token fires or a fatal error occurs.
    fn run(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

pub struct PipelineRunner<P: Pipeline> {
    pipelines: Vec<P>,
    shutdown: CancellationToken,
    poll_jitter_secs: u64,
    grace_period: Duration,
    typetag: &'static str,
}

impl<P: Pipeline> PipelineRunner<P> {
    pub fn new(
        pipelines: Vec<P>,
        shutdown: CancellationToken,
        poll_jitter_secs: u64,
        grace_period: Duration,
        typetag: &'static str,
    ) -> Self {
        Self {
            pipelines,
            shutdown,
            poll_jitter_secs,
            grace_period,
            typetag,
        }
    }

    pub fn spawn_shutdown_handler(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    /// Run every pipeline to completion and return how many failed.
    ///
    /// Once shutdown is requested the pipelines get `grace_period` to wind
    /// down, after which the remaining tasks are aborted.
    #[allow(clippy::type_complexity)]
    pub async fn run(self) -> usize {
        let mut handles: JoinSet<(P::Key, Result<(), P::Error>)> = JoinSet::new();
        let typetag = self.typetag;

        for pipeline in self.pipelines {
            let shutdown = self.shutdown.clone();
            let key = pipeline.key().clone();
            let start_jitter = random_jitter(self.poll_jitter_secs);

            handles.spawn(async move {
                if !start_jitter.is_zero() {
                    info!(
                        target = %key,
                        jitter_ms = start_jitter.as_millis() as u64,
                        "Delaying {} start for jitter", typetag
                    );
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(start_jitter))
                        .await
                        .is_none()
                    {
                        info!(target = %key, "Shutdown requested during jitter delay");
                        return (key, Ok(()));
                    }
                }

                let result = pipeline.run().await;
                (key, result)
            });
        }

        info!("Spawned {} {} tasks", handles.len(), typetag);

        let mut failed = 0;
        let mut deadline = None;
        loop {
            let next = match deadline {
                None => tokio::select! {
                    next = handles.join_next() => next,
                    _ = self.shutdown.cancelled() => {
                        deadline = Some(tokio::time::Instant::now() + self.grace_period);
                        continue;
                    }
                },
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, handles.join_next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(
                                remaining = handles.len(),
                                "Grace period elapsed, aborting remaining {}s", typetag
                            );
                            failed += handles.len();
                            handles.abort_all();
                            break;
                        }
                    }
                }
            };

            let Some(result) = next else { break };
            match result {
                Ok((key, Ok(()))) => {
                    info!(target = %key, "{} completed", typetag);
                }
                Ok((key, Err(e))) => {
                    failed += 1;
                    error!(target = %key, error = %e, "{} failed", typetag);
                }
                Err(e) => {
                    failed += 1;
                    error!(error = %e, "{} task panicked", typetag);
                }
            }
        }

        info!("All {}s complete", typetag);
        failed
    }
}

/// Initialise metrics, build the pipelines and run them until shutdown.
pub async fn run_pipelines<P, F>(
    metrics_address: &str,
    global: &GlobalConfig,
    typetag: &'static str,
    create_pipelines: F,
) -> Result<(), PipelineSetupError>
where
    P: Pipeline,
    F: FnOnce(PipelineContext) -> Vec<P>,
{
    let addr = metrics_address.parse().context(AddressParseSnafu)?;
    crate::metrics::init_global(addr).context(MetricsSnafu)?;

    let shutdown = CancellationToken::new();
    let context = PipelineContext::new(
        global.total_concurrency,
        global.poll_jitter_secs,
        shutdown.clone(),
    );

    let pipelines = create_pipelines(context);

    let runner = PipelineRunner::new(
        pipelines,
        shutdown,
        global.poll_jitter_secs,
        Duration::from_secs(global.shutdown_grace_period_secs),
        typetag,
    );
    runner.spawn_shutdown_handler();
    match runner.run().await {
        0 => Ok(()),
        count => Err(PipelineSetupError::ComponentsFailed { count }),
    }
}

/// Random duration in `[0, max_secs)`.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}
