//! Streaming stage pipelines
//!
//! Compose data-transforming stages into one pipeline that streams bytes
//! between concurrently running stages instead of materializing each stage's
//! output. See [`pipeline`] for the engine and [`pipeline::stages`] for
//! reusable stages.

pub mod config;
pub mod error;
pub mod logger;
pub mod pipeline;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{Context, ContextValues, Pipeline, Stage, StageContext, Value, ValueConverter};
