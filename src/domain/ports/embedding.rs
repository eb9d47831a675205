//! Embedding provider port.

use async_trait::async_trait;

use crate::domain::errors::{CoreError, CoreResult};

/// Fixed embedding width; vectors pack into 4096-byte blobs.
pub const EMBEDDING_DIM: usize = 1024;

/// Narrow seam to the external embedding service. Any failure routes the
/// caller down the FTS fallback path rather than blocking a write.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier reported by health checks.
    fn model(&self) -> &str;

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;

    /// Cheap reachability probe.
    async fn is_available(&self) -> bool;
}

/// Provider used when no embedder is configured: always unavailable, so
/// memory writes store a null embedding and search takes the FTS path.
#[derive(Debug, Clone, Default)]
pub struct NullEmbedding;

#[async_trait]
impl EmbeddingProvider for NullEmbedding {
    fn model(&self) -> &str {
        "null"
    }

    async fn embed(&self, _text: &str) -> CoreResult<Vec<f32>> {
        Err(CoreError::Unavailable("no embedding provider configured".to_string()))
    }

    async fn is_available(&self) -> bool {
        false
    }
}
