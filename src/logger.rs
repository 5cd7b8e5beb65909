//! Log subscriber setup for binaries and tests embedding the pipeline
//!
//! The library itself only emits `tracing` events; targets are
//! `stagepipe::pipeline` for run and stage lifecycle events.

use crate::error::{PipelineError, PipelineResult};
use tracing_subscriber::EnvFilter;

/// Target used by pipeline lifecycle events
pub const PIPELINE_TARGET: &str = "stagepipe::pipeline";

/// Install a global fmt subscriber filtered by `RUST_LOG`
///
/// Falls back to `default_directive` (e.g. `"stagepipe=info"`) when
/// `RUST_LOG` is unset. Returns `Ok(false)` if a global subscriber was
/// already installed.
pub fn init(default_directive: &str) -> PipelineResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive).map_err(|e| {
            PipelineError::Config(format!(
                "Invalid log directive '{}': {}",
                default_directive, e
            ))
        })?,
    };

    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        // Another test may have installed the subscriber first
        let _ = init("stagepipe=debug").unwrap();
        assert!(!init("stagepipe=debug").unwrap());
    }
}
