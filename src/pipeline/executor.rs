use super::context::{ready_carrier, CarrierFuture, Context, StageContext};
use super::convert::{self, ByteStream, Value, ValueConverter};
use super::core::{RunReport, Stage, StageReport};
use super::pipe::{pipe_with_capacity, PipeHandle, PipeWriter};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::logger::PIPELINE_TARGET;
use chrono::Utc;
use futures::FutureExt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pipeline executor that runs stages concurrently, connected by pipes
///
/// Stages run in insertion order: stage `i` reads what stage `i - 1` wrote.
/// Each stage runs in its own task, so a slow stage throttles the stages
/// before it instead of letting output pile up in memory.
///
/// # Example
/// ```
/// use stagepipe::pipeline::stages::ChunkMapStage;
/// use stagepipe::pipeline::{Context, Pipeline, Value};
///
/// # #[tokio::main]
/// # async fn main() {
/// let pipeline = Pipeline::new()
///     .add(ChunkMapStage::new("upper", |chunk: &[u8]| chunk.to_ascii_uppercase()));
///
/// let output = pipeline
///     .run(&Context::new(), Value::from("go"), &[])
///     .await
///     .unwrap();
/// assert_eq!(output, Value::from("GO"));
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    stages: Vec<Arc<dyn Stage>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Create an empty pipeline with default settings
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    /// Create an empty pipeline with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_config(PipelineConfig::default().with_name(name))
    }

    /// Create an empty pipeline with explicit settings
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
        }
    }

    /// Get the pipeline name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Append a stage
    pub fn add<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append a stage shared with other pipelines
    pub fn add_shared(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Get the number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the pipeline on `input` and return the converted output
    ///
    /// `converters` are tried before the built-in conversions, in order. An
    /// empty pipeline returns `input` unchanged.
    pub async fn run(
        &self,
        ctx: &Context,
        input: Value,
        converters: &[Arc<dyn ValueConverter>],
    ) -> PipelineResult<Value> {
        self.run_detailed(ctx, input, converters)
            .await
            .map(|(value, _)| value)
    }

    /// Same as `run()` but also returns per-stage timings
    ///
    /// The first of cancellation, deadline expiry, or stage failure ends the
    /// run. Every pipe is then aborted so stages blocked on a read or write
    /// fail promptly, and the run-scoped token seen by stages is cancelled.
    /// Stage tasks are not awaited after that; later failures are dropped.
    pub async fn run_detailed(
        &self,
        ctx: &Context,
        input: Value,
        converters: &[Arc<dyn ValueConverter>],
    ) -> PipelineResult<(Value, RunReport)> {
        let run_id = Uuid::new_v4();
        let run_start = Instant::now();
        let started_at = Utc::now();

        if self.stages.is_empty() {
            tracing::debug!(
                target: PIPELINE_TARGET,
                %run_id,
                "Pipeline '{}' has no stages, returning input unchanged",
                self.config.name
            );
            let report = RunReport::new(
                run_id,
                &self.config.name,
                started_at,
                Vec::new(),
                Duration::ZERO,
            );
            return Ok((input, report));
        }

        if ctx.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let (source, shape) = convert::to_stream(&input, converters)?;
        drop(input);

        tracing::info!(
            target: PIPELINE_TARGET,
            %run_id,
            "Starting pipeline '{}' with {} stages (shape: {})",
            self.config.name,
            self.stages.len(),
            shape
        );

        let run_token = ctx.cancellation_token().child_token();
        let mut pipes: Vec<PipeHandle> = Vec::with_capacity(self.stages.len());
        let mut tasks = JoinSet::new();
        let mut input: ByteStream = source;
        let mut upstream_pipe: Option<PipeHandle> = None;
        let mut carrier: CarrierFuture = ready_carrier(ctx.values().clone());

        for (index, stage) in self.stages.iter().enumerate() {
            let (reader, writer) = pipe_with_capacity(self.config.pipe_capacity);
            pipes.push(reader.handle());

            let (downstream, next_carrier) = if stage.extends_carrier() {
                let (tx, rx) = oneshot::channel();
                (Some(tx), rx.shared())
            } else {
                (None, carrier.clone())
            };
            let stage_ctx = StageContext::new(
                index,
                stage.name(),
                run_token.clone(),
                carrier,
                downstream,
            );

            tasks.spawn(drive_stage(
                run_id,
                stage.clone(),
                stage_ctx,
                input,
                upstream_pipe.take(),
                writer,
            ));

            carrier = next_carrier;
            upstream_pipe = Some(reader.handle());
            input = Box::new(reader);
        }

        // `input` is now the read end of the last stage's pipe
        let mut output_task = tokio::spawn(collect_output(
            input,
            upstream_pipe,
            self.config.max_output_bytes,
        ));

        let deadline = ctx.deadline();
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let mut remaining = self.stages.len();
        let mut stage_reports = Vec::with_capacity(self.stages.len());
        let mut collected: Option<Vec<u8>> = None;

        let waited: PipelineResult<Vec<u8>> = loop {
            if remaining == 0 {
                if let Some(bytes) = collected.take() {
                    break Ok(bytes);
                }
            }

            tokio::select! {
                _ = ctx.cancellation_token().cancelled() => break Err(PipelineError::Cancelled),
                _ = &mut expired => break Err(PipelineError::DeadlineExceeded),
                joined = tasks.join_next(), if remaining > 0 => match joined {
                    Some(Ok(outcome)) => {
                        remaining -= 1;
                        match outcome.result {
                            Ok(()) => stage_reports.push(StageReport::new(
                                outcome.stage_name,
                                outcome.index,
                                outcome.duration,
                            )),
                            Err(e) => {
                                tracing::error!(
                                    target: PIPELINE_TARGET,
                                    %run_id,
                                    "Stage '{}' failed: {}",
                                    outcome.stage_name,
                                    e
                                );
                                break Err(e);
                            }
                        }
                    }
                    Some(Err(join_err)) => break Err(join_err.into()),
                    None => remaining = 0,
                },
                drained = &mut output_task, if collected.is_none() => match drained {
                    Ok(Ok(bytes)) => collected = Some(bytes),
                    Ok(Err(e)) => break Err(e),
                    Err(join_err) => break Err(join_err.into()),
                },
            }
        };

        let bytes = match waited {
            Ok(bytes) => bytes,
            Err(err) => {
                teardown(&run_token, &pipes, &mut tasks, &output_task);
                if err.is_cancellation() {
                    tracing::info!(
                        target: PIPELINE_TARGET,
                        %run_id,
                        "Pipeline '{}' stopped: {}",
                        self.config.name,
                        err
                    );
                } else {
                    tracing::error!(
                        target: PIPELINE_TARGET,
                        %run_id,
                        "Pipeline '{}' failed after {:.2}s: {}",
                        self.config.name,
                        run_start.elapsed().as_secs_f64(),
                        err
                    );
                }
                return Err(err);
            }
        };

        let output_len = bytes.len();
        let stream: ByteStream = Box::new(Cursor::new(bytes));
        let value = convert::from_stream(stream, &shape, converters)
            .await
            .map_err(|e| {
                tracing::error!(
                    target: PIPELINE_TARGET,
                    %run_id,
                    "Pipeline '{}' output conversion failed: {}",
                    self.config.name,
                    e
                );
                e
            })?;

        let total_duration = run_start.elapsed();
        tracing::info!(
            target: PIPELINE_TARGET,
            %run_id,
            "Pipeline '{}' completed in {:.2}s ({} output bytes)",
            self.config.name,
            total_duration.as_secs_f64(),
            output_len
        );

        Ok((
            value,
            RunReport::new(
                run_id,
                &self.config.name,
                started_at,
                stage_reports,
                total_duration,
            ),
        ))
    }
}

struct StageOutcome {
    index: usize,
    stage_name: String,
    duration: Duration,
    result: PipelineResult<()>,
}

/// Task body for one stage: serve, then close the output exactly once
async fn drive_stage(
    run_id: Uuid,
    stage: Arc<dyn Stage>,
    mut ctx: StageContext,
    mut input: ByteStream,
    upstream_pipe: Option<PipeHandle>,
    mut output: PipeWriter,
) -> StageOutcome {
    let index = ctx.index();
    let stage_name = ctx.stage_name().to_string();
    tracing::debug!(
        target: PIPELINE_TARGET,
        %run_id,
        "Executing stage {}: {}",
        index + 1,
        stage_name
    );

    let stage_start = Instant::now();
    let result = stage.serve(&mut ctx, &mut *input, &mut output).await;
    let duration = stage_start.elapsed();

    output.close();
    // Unread input is dropped so the upstream stage can finish
    if let Some(upstream) = upstream_pipe {
        upstream.discard();
    }
    drop(input);

    match &result {
        Ok(()) => tracing::debug!(
            target: PIPELINE_TARGET,
            %run_id,
            "Stage '{}' completed in {:.2}s",
            stage_name,
            duration.as_secs_f64()
        ),
        Err(e) => tracing::debug!(
            target: PIPELINE_TARGET,
            %run_id,
            "Stage '{}' returned error after {:.2}s: {}",
            stage_name,
            duration.as_secs_f64(),
            e
        ),
    }

    if result.is_ok() {
        ctx.finish().await;
    } else {
        // A failure is reported right away; the carrier handoff finishes on
        // its own or ends with the run token
        tokio::spawn(ctx.finish());
    }

    StageOutcome {
        index,
        stage_name,
        duration,
        result,
    }
}

/// Drain the last pipe into memory, enforcing the optional size limit
async fn collect_output(
    mut reader: ByteStream,
    pipe: Option<PipeHandle>,
    limit: Option<usize>,
) -> PipelineResult<Vec<u8>> {
    let mut output = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(output);
        }
        if let Some(limit) = limit {
            if output.len() + n > limit {
                // Let the last stage finish instead of failing on a closed pipe
                if let Some(pipe) = &pipe {
                    pipe.discard();
                }
                return Err(PipelineError::Conversion(format!(
                    "pipeline output exceeds {} bytes",
                    limit
                )));
            }
        }
        output.extend_from_slice(&buf[..n]);
    }
}

fn teardown<T: 'static>(
    run_token: &CancellationToken,
    pipes: &[PipeHandle],
    tasks: &mut JoinSet<T>,
    output_task: &JoinHandle<PipelineResult<Vec<u8>>>,
) {
    run_token.cancel();
    for pipe in pipes {
        pipe.abort();
    }
    output_task.abort();
    tasks.detach_all();
}
