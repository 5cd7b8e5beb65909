use crate::error::PipelineResult;
use crate::pipeline::{Stage, StageContext};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Stage that reads its whole input, transforms it, and writes the result
///
/// For transforms that need the complete payload (reversing, parsing a
/// document). Memory use grows with the input, unlike [`ChunkMapStage`].
///
/// [`ChunkMapStage`]: super::ChunkMapStage
pub struct BufferedStage<F> {
    name: String,
    transform: F,
}

impl<F> BufferedStage<F>
where
    F: Fn(Vec<u8>) -> PipelineResult<Vec<u8>> + Send + Sync,
{
    /// Create a buffered stage
    pub fn new(name: impl Into<String>, transform: F) -> Self {
        Self {
            name: name.into(),
            transform,
        }
    }
}

#[async_trait]
impl<F> Stage for BufferedStage<F>
where
    F: Fn(Vec<u8>) -> PipelineResult<Vec<u8>> + Send + Sync,
{
    async fn serve(
        &self,
        _ctx: &mut StageContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> PipelineResult<()> {
        let mut payload = Vec::new();
        input.read_to_end(&mut payload).await?;

        let transformed = (self.transform)(payload)?;
        output.write_all(&transformed).await?;
        output.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
