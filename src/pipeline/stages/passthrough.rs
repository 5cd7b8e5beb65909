use crate::error::PipelineResult;
use crate::pipeline::{Stage, StageContext};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Stage that copies its input to its output unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughStage;

impl PassthroughStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for PassthroughStage {
    async fn serve(
        &self,
        _ctx: &mut StageContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> PipelineResult<()> {
        tokio::io::copy(input, output).await?;
        output.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Passthrough"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::test_support::serve_bytes;
    use crate::pipeline::ContextValues;

    #[tokio::test]
    async fn test_passthrough_copies_input() {
        let (result, output, carrier) =
            serve_bytes(&PassthroughStage::new(), b"unchanged", ContextValues::new()).await;

        assert!(result.is_ok());
        assert_eq!(output, b"unchanged");
        assert!(carrier.is_none());
    }

    #[test]
    fn test_passthrough_name() {
        assert_eq!(PassthroughStage.name(), "Passthrough");
    }
}
