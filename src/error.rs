use thiserror::Error;

/// Central error type for pipeline construction and execution
#[derive(Error, Debug)]
pub enum PipelineError {
    // ============================================================================
    // Boundary Conversion Errors
    // ============================================================================
    #[error("Conversion failed: {0}")]
    Conversion(String),

    // ============================================================================
    // Run Termination Errors
    // ============================================================================
    #[error("Pipeline run was cancelled")]
    Cancelled,

    #[error("Pipeline run exceeded its deadline")]
    DeadlineExceeded,

    /// Failure reported by a stage's `serve` call
    #[error("{0}")]
    Stage(String),

    #[error("Stage task failed: {0}")]
    TaskFailed(String),

    // ============================================================================
    // Context Carrier Errors
    // ============================================================================
    #[error("Context carrier error: {0}")]
    Carrier(String),

    #[error("Required context key not found: {0}")]
    MissingKey(String),

    // ============================================================================
    // Generic/System Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether this error ended the run because of cancellation or a deadline
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled | PipelineError::DeadlineExceeded)
    }
}

// Stages commonly fail with a plain message
impl From<String> for PipelineError {
    fn from(err: String) -> Self {
        PipelineError::Stage(err)
    }
}

impl From<&str> for PipelineError {
    fn from(err: &str) -> Self {
        PipelineError::Stage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            PipelineError::TaskFailed("task was aborted".to_string())
        } else {
            PipelineError::TaskFailed(format!("task panicked: {}", err))
        }
    }
}

// Helper type alias for Results
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Cancelled;
        assert_eq!(err.to_string(), "Pipeline run was cancelled");
    }

    #[test]
    fn test_stage_error_is_not_wrapped() {
        let err: PipelineError = "boom".into();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "read end closed");
        let err: PipelineError = io_err.into();
        assert!(matches!(err, PipelineError::Io(_)));
        assert!(err.to_string().contains("read end closed"));
    }

    #[test]
    fn test_is_cancellation() {
        assert!(PipelineError::Cancelled.is_cancellation());
        assert!(PipelineError::DeadlineExceeded.is_cancellation());
        assert!(!PipelineError::Stage("x".to_string()).is_cancellation());
    }

    #[tokio::test]
    async fn test_join_error_conversion() {
        let handle = tokio::spawn(async {
            panic!("stage exploded");
        });
        let join_err = handle.await.unwrap_err();
        let err: PipelineError = join_err.into();
        assert!(matches!(err, PipelineError::TaskFailed(_)));
    }
}
