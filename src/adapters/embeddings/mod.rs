//! Embedding provider adapters.

pub mod ollama;

pub use ollama::OllamaEmbeddingProvider;
