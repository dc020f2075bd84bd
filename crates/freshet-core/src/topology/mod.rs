//! Running several components side by side under one shutdown token.

mod pipeline;

pub use pipeline::{
    Pipeline, PipelineContext, PipelineRunner, random_jitter, run_pipelines,
};
