use crate::error::PipelineResult;
use crate::logger::PIPELINE_TARGET;
use crate::pipeline::{Stage, StageContext};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default carrier key for the digest
pub const DEFAULT_DIGEST_KEY: &str = "sha256";

/// Stage that streams bytes through unchanged while calculating their
/// SHA-256 hash
///
/// # Context Outputs
/// - `sha256` (or the configured key) - lowercase hex digest of the stream
///
/// The digest is forwarded after the last byte has been consumed downstream.
///
/// # Example
/// ```
/// use stagepipe::pipeline::stages::{HashStage, PassthroughStage};
/// use stagepipe::pipeline::Pipeline;
///
/// let pipeline = Pipeline::named("hash-payload")
///     .add(HashStage::new())
///     .add(PassthroughStage::new());
/// ```
pub struct HashStage {
    key: String,
}

impl HashStage {
    /// Create a hash stage using the default carrier key
    pub fn new() -> Self {
        Self::with_key(DEFAULT_DIGEST_KEY)
    }

    /// Create a hash stage that binds the digest under `key`
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for HashStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for HashStage {
    async fn serve(
        &self,
        ctx: &mut StageContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> PipelineResult<()> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        let mut total: u64 = 0;

        loop {
            let bytes_read = input.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            output.write_all(&buffer[..bytes_read]).await?;
            total += bytes_read as u64;
        }

        let digest = hex::encode(hasher.finalize());
        tracing::debug!(
            target: PIPELINE_TARGET,
            "Stream hash calculated: {} ({} bytes, stage {})",
            digest,
            total,
            ctx.index() + 1
        );

        let values = ctx.values().await?;
        ctx.forward(values.with_string(self.key.clone(), digest))?;
        output.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Calculate Hash"
    }

    fn extends_carrier(&self) -> bool {
        true
    }
}
