//! Ports: traits at the seams to external collaborators.

pub mod embedding;

pub use embedding::{EmbeddingProvider, NullEmbedding, EMBEDDING_DIM};
