use crate::error::PipelineResult;
use crate::pipeline::{Stage, StageContext};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default read size for chunked stages
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Stage that applies a byte transform to each chunk as it arrives
///
/// Memory use is bounded by the chunk size. Chunk boundaries follow the
/// reads, so the transform must not depend on how the input is split
/// (byte-wise case mapping is fine, multi-byte UTF-8 decoding is not).
///
/// # Example
/// ```
/// use stagepipe::pipeline::stages::ChunkMapStage;
///
/// let upper = ChunkMapStage::new("Upper", |chunk: &[u8]| chunk.to_ascii_uppercase());
/// ```
pub struct ChunkMapStage<F> {
    name: String,
    map: F,
    chunk_size: usize,
}

impl<F> ChunkMapStage<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    /// Create a chunk map stage
    pub fn new(name: impl Into<String>, map: F) -> Self {
        Self {
            name: name.into(),
            map,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the maximum number of bytes passed to the transform at once
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl<F> Stage for ChunkMapStage<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    async fn serve(
        &self,
        _ctx: &mut StageContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> PipelineResult<()> {
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let mapped = (self.map)(&buf[..n]);
            output.write_all(&mapped).await?;
        }
        output.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::test_support::serve_bytes;
    use crate::pipeline::ContextValues;

    #[tokio::test]
    async fn test_chunk_map_uppercases() {
        let stage = ChunkMapStage::new("Upper", |chunk: &[u8]| chunk.to_ascii_uppercase())
            .with_chunk_size(2);
        let (result, output, _) = serve_bytes(&stage, b"streaming", ContextValues::new()).await;

        assert!(result.is_ok());
        assert_eq!(output, b"STREAMING");
    }

    #[tokio::test]
    async fn test_chunk_map_sees_bounded_chunks() {
        let stage = ChunkMapStage::new("Check", |chunk: &[u8]| {
            assert!(chunk.len() <= 3);
            chunk.to_vec()
        })
        .with_chunk_size(3);
        let (result, output, _) = serve_bytes(&stage, &[1u8; 10], ContextValues::new()).await;

        assert!(result.is_ok());
        assert_eq!(output.len(), 10);
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let stage = ChunkMapStage::new("Id", |chunk: &[u8]| chunk.to_vec()).with_chunk_size(0);
        assert_eq!(stage.chunk_size, 1);
        assert_eq!(stage.name(), "Id");
    }
}
