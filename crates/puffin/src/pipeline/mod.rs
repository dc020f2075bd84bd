//! Bus consumers built from configuration.

mod processor;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use freshet_core::bus::StorageBus;
use freshet_core::dlq::sink_from_config;
use freshet_core::{
    AppConfig, Pipeline, PipelineContext, StorageProvider, StorageProviderRef, run_polling_loop,
};

use crate::config::{Config, ConfigPath, ConsumerConfig, ConsumerKey};
use crate::error::{ConfigError, PipelineError};
use crate::router::Router;
use crate::schema::SchemaRegistry;
use crate::sink::{RawArchiveWriter, TypedRecordWriter};
use crate::transform::Transformer;

pub use processor::ConsumerProcessor;

async fn create_storage(
    url: &str,
    options: HashMap<String, String>,
) -> Result<StorageProviderRef, PipelineError> {
    Ok(Arc::new(
        StorageProvider::for_url_with_options(url, options).await?,
    ))
}

/// A configured consumer of one bus subscription.
pub struct PuffinConsumer {
    pub key: ConsumerKey,
    pub config: ConsumerConfig,
    pub context: PipelineContext,
}

impl PuffinConsumer {
    pub fn from_config(config: &Config, context: PipelineContext) -> Vec<Self> {
        config
            .consumers
            .iter()
            .map(|(key, cfg)| Self {
                key: key.clone(),
                config: cfg.clone(),
                context: context.clone(),
            })
            .collect()
    }

    /// Wire the subscription, registry, writers and dead-letter sink.
    async fn build(&self) -> Result<(ConsumerProcessor, Arc<SchemaRegistry>), PipelineError> {
        let config = &self.config;
        let target = self.key.id();

        let bus_storage = create_storage(
            &config.subscription.path,
            config.subscription.storage_options.clone(),
        )
        .await?;
        let subscription = StorageBus::new(bus_storage).subscribe(
            config.subscription_name(&self.key),
            &config.subscription.topic,
            config.subscription.settle_ms,
        );

        let dlq = sink_from_config(&config.error_handling, target).await?;
        let registry = Arc::new(SchemaRegistry::load(config.registry_source(), target)?);

        let mut router = Router::new(
            Transformer::new(registry.clone()),
            dlq,
            config.write_retry.clone(),
            self.context.shutdown.clone(),
            target,
        );
        if let Some(raw) = &config.raw {
            let storage = create_storage(&raw.path, raw.storage_options.clone()).await?;
            router = router.with_raw(Arc::new(RawArchiveWriter::new(storage, target)));
        }
        if let Some(typed) = &config.typed {
            let storage = create_storage(&typed.path, typed.storage_options.clone()).await?;
            router = router.with_typed(Arc::new(TypedRecordWriter::new(
                storage,
                typed.compression,
                target,
            )));
        }

        let processor =
            ConsumerProcessor::new(Box::new(subscription), router, config.batch_size, target)
                .with_global_permits(self.context.global_semaphore.clone());
        Ok((processor, registry))
    }

    async fn execute(self) -> Result<(), PipelineError> {
        let shutdown = self.context.shutdown.clone();

        let (mut processor, registry) = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = %self.key, "Shutdown requested during initialization");
                return Ok(());
            }

            result = self.build() => result?,
        };

        if self.config.typed.is_some()
            && let Some(interval) = self.config.registry.reload_interval()
        {
            tokio::spawn(registry.run_reloads(interval, shutdown.clone()));
        }

        run_polling_loop(
            &mut processor,
            self.config.poll_interval(),
            self.context.poll_jitter_secs,
            shutdown,
            self.key.id(),
            "puffin",
        )
        .await
    }
}

impl Pipeline for PuffinConsumer {
    type Key = ConsumerKey;
    type Error = PipelineError;

    fn key(&self) -> &Self::Key {
        &self.key
    }

    async fn run(self) -> Result<(), Self::Error> {
        self.execute().await
    }
}

impl AppConfig for Config {
    type Pipeline = PuffinConsumer;

    const COMPONENT_NAME: &'static str = "consumer";

    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        Config::from_paths(paths)
    }

    fn create_pipelines(&self, context: PipelineContext) -> Vec<PuffinConsumer> {
        PuffinConsumer::from_config(self, context)
    }

    fn log_startup_info(&self) {
        info!(
            consumers = self.consumers.len(),
            total_concurrency = ?self.global.total_concurrency,
            "Loaded puffin configuration"
        );
        for (key, consumer) in self.consumers() {
            info!(
                target = %key,
                bus = %consumer.subscription.path,
                topic = %consumer.subscription.topic,
                subscription = consumer.subscription_name(key),
                raw = consumer.raw.as_ref().map(|r| r.path.as_str()),
                typed = consumer.typed.as_ref().map(|t| t.path.as_str()),
                "Consumer configured"
            );
        }
    }
}
