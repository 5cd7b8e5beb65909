//! Reusable pipeline stages
//!
//! 1. PassthroughStage - Copy input to output unchanged
//! 2. ChunkMapStage - Transform each chunk as it streams through
//! 3. BufferedStage - Transform the whole input at once
//! 4. HashStage - Pass bytes through and forward their SHA-256 digest
//! 5. AnnotateStage - Pass bytes through and extend the context carrier

pub mod annotate;
pub mod buffered;
pub mod chunk_map;
pub mod hash;
pub mod passthrough;

// Re-export stages
pub use annotate::AnnotateStage;
pub use buffered::BufferedStage;
pub use chunk_map::ChunkMapStage;
pub use hash::HashStage;
pub use passthrough::PassthroughStage;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::pipeline::context::{ready_carrier, ContextValues, StageContext};
    use crate::pipeline::Stage;
    use crate::PipelineResult;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    /// Serve `stage` once over an in-memory input, returning output and the
    /// forwarded carrier (if the stage extends it)
    pub async fn serve_bytes<S: Stage>(
        stage: &S,
        input: &[u8],
        upstream: ContextValues,
    ) -> (PipelineResult<()>, Vec<u8>, Option<ContextValues>) {
        let (tx, rx) = oneshot::channel();
        let downstream = if stage.extends_carrier() {
            Some(tx)
        } else {
            drop(tx);
            None
        };
        let mut ctx = StageContext::new(
            0,
            stage.name(),
            CancellationToken::new(),
            ready_carrier(upstream),
            downstream,
        );

        let mut reader = input;
        let mut output: Vec<u8> = Vec::new();
        let result = stage.serve(&mut ctx, &mut reader, &mut output).await;
        ctx.finish().await;
        (result, output, rx.await.ok())
    }
}
