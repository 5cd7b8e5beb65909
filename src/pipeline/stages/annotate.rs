use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{Stage, StageContext};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Stage that passes bytes through and binds a fixed key on the carrier
///
/// Bytes are copied while the stage waits for the upstream carrier, so an
/// upstream stage that forwards only after writing everything (such as
/// [`HashStage`]) never stalls on this one.
///
/// [`HashStage`]: super::HashStage
///
/// # Context Outputs
/// - `key` bound to `value`
pub struct AnnotateStage {
    key: String,
    value: Value,
}

impl AnnotateStage {
    /// Create an annotate stage
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Stage for AnnotateStage {
    async fn serve(
        &self,
        ctx: &mut StageContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> PipelineResult<()> {
        let annotate = async {
            let values = ctx.values().await?;
            ctx.forward(values.with_value(self.key.clone(), self.value.clone()))
        };
        let copy = async {
            tokio::io::copy(input, output).await?;
            output.flush().await?;
            Ok::<_, PipelineError>(())
        };

        tokio::try_join!(annotate, copy)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Annotate"
    }

    fn extends_carrier(&self) -> bool {
        true
    }
}
