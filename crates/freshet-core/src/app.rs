//! Shared `main` for the freshet and puffin binaries.
//!
//! [`Application::launch`] turns parsed arguments into a loaded
//! configuration plus what to do with it; [`Application::run`] acts on that
//! and maps the result to an exit code.

use std::process::ExitCode;

use clap::Parser;
use snafu::ensure;
use tracing::{error, info};

use crate::config::{CliArgs, ConfigPath, Mergeable};
use crate::error::{ConfigError, NoConfigSourcesSnafu};
use crate::topology::{Pipeline, PipelineContext, run_pipelines};
use crate::tracing::init_tracing;

/// A binary's configuration: loads from YAML and builds its pipelines.
pub trait AppConfig: Mergeable + Sized {
    type Pipeline: Pipeline;

    /// Label for components in logs ("pipeline", "consumer").
    const COMPONENT_NAME: &'static str;

    /// Load, merge and validate.
    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError>;

    fn create_pipelines(&self, context: PipelineContext) -> Vec<Self::Pipeline>;

    fn log_startup_info(&self);
}

/// A loaded configuration and what the command line asked for.
#[derive(Debug)]
pub enum Launch<C> {
    /// `--validate`: report the configuration and exit.
    Validate(C),
    /// Run every component until shutdown.
    Serve(C),
}

impl<C> Launch<C> {
    pub fn config(&self) -> &C {
        match self {
            Launch::Validate(config) | Launch::Serve(config) => config,
        }
    }
}

pub struct Application<C: AppConfig> {
    config: C,
}

impl<C: AppConfig> Application<C> {
    pub fn run() -> ExitCode {
        init_tracing();

        match Self::launch(&CliArgs::parse()) {
            Ok(Launch::Validate(config)) => {
                config.log_startup_info();
                println!("Configuration is valid");
                ExitCode::SUCCESS
            }
            Ok(Launch::Serve(config)) => Self { config }.serve(),
            Err(e) => {
                error!(error = %e, "Failed to load configuration");
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        }
    }

    /// Resolve the configuration sources named in `args` and load them.
    pub fn launch(args: &CliArgs) -> Result<Launch<C>, ConfigError> {
        let paths = args.config_paths();
        ensure!(!paths.is_empty(), NoConfigSourcesSnafu);

        info!(sources = paths.len(), "Loading configuration");
        let config = C::from_paths(&paths)?;

        Ok(if args.validate {
            Launch::Validate(config)
        } else {
            Launch::Serve(config)
        })
    }

    fn serve(self) -> ExitCode {
        self.config.log_startup_info();

        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Failed to start the tokio runtime");
                return ExitCode::FAILURE;
            }
        };
        let result = runtime.block_on(run_pipelines(
            &Mergeable::metrics(&self.config).address,
            Mergeable::global(&self.config),
            C::COMPONENT_NAME,
            |context| self.config.create_pipelines(context),
        ));

        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, component = C::COMPONENT_NAME, "Stopped with an error");
                ExitCode::FAILURE
            }
        }
    }
}
