use crate::error::PipelineResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use super::context::StageContext;

/// A single stage in a pipeline
///
/// A stage consumes one input byte stream and produces one output byte
/// stream. Stages of a pipeline run concurrently, each in its own task,
/// connected by pipes.
///
/// A stage reads only what it needs from `input`; unread bytes are
/// discarded once it returns. It must not close `output` itself: the
/// pipeline closes it exactly once after `serve` returns, whether or not
/// the stage succeeded. Neither stream may be kept past the return.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use stagepipe::pipeline::{Stage, StageContext};
/// use stagepipe::PipelineResult;
/// use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
///
/// struct Upper;
///
/// #[async_trait]
/// impl Stage for Upper {
///     async fn serve(
///         &self,
///         _ctx: &mut StageContext,
///         input: &mut (dyn AsyncRead + Send + Unpin),
///         output: &mut (dyn AsyncWrite + Send + Unpin),
///     ) -> PipelineResult<()> {
///         let mut buf = [0u8; 4096];
///         loop {
///             let n = input.read(&mut buf).await?;
///             if n == 0 {
///                 return Ok(());
///             }
///             output.write_all(&buf[..n].to_ascii_uppercase()).await?;
///         }
///     }
///
///     fn name(&self) -> &str {
///         "Upper"
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: Send + Sync {
    /// Transform `input` into `output`
    ///
    /// Errors stop the pipeline and are returned to the caller unchanged.
    async fn serve(
        &self,
        ctx: &mut StageContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> PipelineResult<()>;

    /// Get stage name for logging
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether this stage may hand an extended carrier to the next stage
    ///
    /// Stages that return false pass the upstream carrier through
    /// immediately. Stages that return true should call
    /// [`StageContext::forward`] before blocking on large writes, since the
    /// next stage may be waiting for the carrier.
    fn extends_carrier(&self) -> bool {
        false
    }
}

/// Timing of one stage in a successful run
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Stage name
    pub stage_name: String,

    /// Zero-based position in the pipeline
    pub index: usize,

    /// Time from task start until `serve` returned
    pub duration: Duration,
}

impl StageReport {
    pub fn new(stage_name: impl Into<String>, index: usize, duration: Duration) -> Self {
        Self {
            stage_name: stage_name.into(),
            index,
            duration,
        }
    }
}

/// Summary of a successful pipeline run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Identifier used in log events for this run
    pub run_id: Uuid,

    /// Pipeline name
    pub pipeline_name: String,

    /// Wall-clock time the run started
    pub started_at: DateTime<Utc>,

    /// Reports in pipeline order
    pub stage_reports: Vec<StageReport>,

    /// Total duration including output conversion
    pub total_duration: Duration,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        pipeline_name: impl Into<String>,
        started_at: DateTime<Utc>,
        mut stage_reports: Vec<StageReport>,
        total_duration: Duration,
    ) -> Self {
        stage_reports.sort_by_key(|r| r.index);
        Self {
            run_id,
            pipeline_name: pipeline_name.into(),
            started_at,
            stage_reports,
            total_duration,
        }
    }

    /// Number of stages that ran
    pub fn stage_count(&self) -> usize {
        self.stage_reports.len()
    }

    /// The stage that took the longest (if any)
    pub fn slowest_stage(&self) -> Option<&StageReport> {
        self.stage_reports.iter().max_by_key(|r| r.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_report() {
        let report = StageReport::new("Upper", 0, Duration::from_millis(5));
        assert_eq!(report.stage_name, "Upper");
        assert_eq!(report.index, 0);
        assert_eq!(report.duration, Duration::from_millis(5));
    }

    #[test]
    fn test_run_report_orders_stages() {
        let reports = vec![
            StageReport::new("Stage 2", 1, Duration::from_millis(30)),
            StageReport::new("Stage 1", 0, Duration::from_millis(10)),
        ];
        let report = RunReport::new(
            Uuid::new_v4(),
            "test",
            Utc::now(),
            reports,
            Duration::from_millis(40),
        );

        assert_eq!(report.stage_count(), 2);
        assert_eq!(report.stage_reports[0].stage_name, "Stage 1");
        assert_eq!(report.slowest_stage().unwrap().stage_name, "Stage 2");
    }

    #[test]
    fn test_empty_run_report() {
        let report = RunReport::new(
            Uuid::new_v4(),
            "empty",
            Utc::now(),
            Vec::new(),
            Duration::ZERO,
        );
        assert_eq!(report.stage_count(), 0);
        assert!(report.slowest_stage().is_none());
    }
}
