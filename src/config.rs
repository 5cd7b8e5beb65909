use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::pipe::DEFAULT_PIPE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pipeline execution settings
///
/// Every field has a default, so a partial JSON document is valid:
///
/// ```
/// use stagepipe::PipelineConfig;
///
/// let config = PipelineConfig::from_json_str(r#"{ "name": "augment" }"#).unwrap();
/// assert_eq!(config.name, "augment");
/// assert_eq!(config.pipe_capacity, 32 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name used in log events and run reports
    pub name: String,

    /// Maximum bytes in flight on each pipe between stages
    pub pipe_capacity: usize,

    /// Upper bound on the bytes the last stage may write; exceeding it fails
    /// the run with a conversion error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            max_output_bytes: None,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(format!("Invalid pipeline config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = Some(limit);
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> PipelineResult<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config(
                "Pipeline name must not be empty".to_string(),
            ));
        }
        if self.pipe_capacity == 0 {
            return Err(PipelineError::Config(
                "pipe_capacity must be at least 1 byte".to_string(),
            ));
        }
        if self.max_output_bytes == Some(0) {
            return Err(PipelineError::Config(
                "max_output_bytes must be at least 1 byte when set".to_string(),
            ));
        }
        Ok(())
    }
}
