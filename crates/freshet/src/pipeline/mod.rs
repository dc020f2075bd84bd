//! Ingestion pipelines built from configuration.

mod ingester;

use std::collections::HashMap;
use std::sync::Arc;

use snafu::ResultExt;
use tracing::info;

use freshet_core::bus::StorageBus;
use freshet_core::dlq::sink_from_config;
use freshet_core::{AppConfig, Pipeline, PipelineContext, StorageProvider, StorageProviderRef};

use crate::checkpoint::StorageCheckpointStore;
use crate::config::{Config, ConfigPath, PipelineConfig, PipelineKey};
use crate::error::{ConfigError, DlqSnafu, PipelineError, StorageSnafu};
use crate::source::StorageFeed;

pub use ingester::{IngestReport, Ingester};

pub(crate) async fn create_storage(
    url: &str,
    options: HashMap<String, String>,
) -> Result<StorageProviderRef, PipelineError> {
    Ok(Arc::new(
        StorageProvider::for_url_with_options(url, options)
            .await
            .context(StorageSnafu)?,
    ))
}

/// A configured pipeline, backed by object storage.
pub struct FreshetPipeline {
    pub key: PipelineKey,
    pub config: PipelineConfig,
    pub context: PipelineContext,
}

impl FreshetPipeline {
    pub fn from_config(config: &Config, context: PipelineContext) -> Vec<Self> {
        config
            .pipelines
            .iter()
            .map(|(key, cfg)| Self {
                key: key.clone(),
                config: cfg.clone(),
                context: context.clone(),
            })
            .collect()
    }

    /// Wire the storage-backed feed, bus, checkpoint store and dead-letter sink.
    async fn build(&self) -> Result<Ingester, PipelineError> {
        let config = &self.config;

        let source = create_storage(&config.source.path, config.source.storage_options.clone()).await?;
        let bus = create_storage(&config.bus.path, config.bus.storage_options.clone()).await?;
        let checkpoints = create_storage(
            &config.checkpoint.path,
            config.checkpoint.storage_options.clone(),
        )
        .await?;
        let dlq = sink_from_config(&config.error_handling, self.key.id())
            .await
            .context(DlqSnafu)?;

        Ok(Ingester::new(
            self.key.clone(),
            config.clone(),
            Arc::new(StorageFeed::new(source, "")),
            Arc::new(StorageBus::new(bus)),
            Arc::new(StorageCheckpointStore::new(
                checkpoints,
                config.checkpoint.token_staleness(),
            )),
            dlq,
        )
        .with_global_permits(self.context.global_semaphore.clone()))
    }

    async fn execute(self) -> Result<(), PipelineError> {
        let shutdown = self.context.shutdown.clone();

        let ingester = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = %self.key, "Shutdown requested during initialization");
                return Ok(());
            }

            result = self.build() => result?,
        };

        ingester.run(shutdown).await?;
        Ok(())
    }
}

impl Pipeline for FreshetPipeline {
    type Key = PipelineKey;
    type Error = PipelineError;

    fn key(&self) -> &Self::Key {
        &self.key
    }

    async fn run(self) -> Result<(), Self::Error> {
        self.execute().await
    }
}

impl AppConfig for Config {
    type Pipeline = FreshetPipeline;

    const COMPONENT_NAME: &'static str = "pipeline";

    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        Config::from_paths(paths)
    }

    fn create_pipelines(&self, context: PipelineContext) -> Vec<FreshetPipeline> {
        FreshetPipeline::from_config(self, context)
    }

    fn log_startup_info(&self) {
        info!(
            pipelines = self.pipeline_count(),
            total_concurrency = ?self.global.total_concurrency,
            "Loaded freshet configuration"
        );
        for (key, pipeline) in self.pipelines() {
            info!(
                target = %key,
                source = %pipeline.source.path,
                bus = %pipeline.bus.path,
                topic = %pipeline.bus.topic,
                collections = ?pipeline.source.collections,
                workers = pipeline.publisher.workers,
                "Pipeline configured"
            );
        }
    }
}
