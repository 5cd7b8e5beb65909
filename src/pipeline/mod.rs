//! Streaming pipeline of concurrently running stages
//!
//! Stages are connected by synchronous byte pipes: each stage runs in its own
//! task, reads what the previous stage wrote and writes for the next one. A
//! slow stage throttles its producers, so memory use stays bounded no matter
//! how large the payload is. Values are converted to a byte stream on the
//! way in and back on the way out.
//!
//! Stages share nothing but the cancellation signal and an immutable context
//! carrier. A stage that needs to pass data forward extends the carrier and
//! hands the new value to the next stage.
//!
//! # Example
//! ```
//! use stagepipe::pipeline::stages::{AnnotateStage, BufferedStage, ChunkMapStage};
//! use stagepipe::pipeline::{Context, Pipeline, Value};
//!
//! # #[tokio::main]
//! # async fn main() -> stagepipe::PipelineResult<()> {
//! let pipeline = Pipeline::named("upper-reverse")
//!     .add(ChunkMapStage::new("Upper", |chunk: &[u8]| chunk.to_ascii_uppercase()))
//!     .add(AnnotateStage::new("tool", "reverse"))
//!     .add(BufferedStage::new("Reverse", |mut bytes: Vec<u8>| {
//!         bytes.reverse();
//!         Ok(bytes)
//!     }));
//!
//! let output = pipeline.run(&Context::new(), Value::from("abc"), &[]).await?;
//! assert_eq!(output, Value::from("CBA"));
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod convert;
pub mod core;
pub mod executor;
pub mod pipe;
pub mod stages;

// Re-export main types
pub use context::{Context, ContextValues, StageContext};
pub use convert::{BuiltinConverter, ByteStream, Shape, Value, ValueConverter};
pub use self::core::{RunReport, Stage, StageReport};
pub use executor::Pipeline;
pub use pipe::{pipe, pipe_with_capacity, PipeHandle, PipeReader, PipeWriter};
