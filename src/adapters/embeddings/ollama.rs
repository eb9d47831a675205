//! Ollama-compatible embedding provider adapter.
//!
//! Consumes two endpoints: `GET /api/tags` as a health probe (model list)
//! and `POST /api/embeddings` with `{model, prompt}` returning
//! `{embedding: [f32; 1024]}`. Any non-2xx or malformed response is
//! reported as `Unavailable`, which routes callers to the FTS fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::EmbedderConfig;
use crate::domain::ports::embedding::{EmbeddingProvider, EMBEDDING_DIM};

pub struct OllamaEmbeddingProvider {
    config: EmbedderConfig,
    client: reqwest::Client,
}

impl OllamaEmbeddingProvider {
    pub fn new(config: EmbedderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.host.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let request = EmbeddingsRequest {
            model: self.config.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(self.endpoint("api/embeddings"))
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(format!("embedder request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Unavailable(format!(
                "embedder returned {}",
                response.status()
            )));
        }

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Unavailable(format!("malformed embedder response: {e}")))?;

        if body.embedding.len() != EMBEDDING_DIM {
            return Err(CoreError::Unavailable(format!(
                "embedder returned {} dimensions, expected {EMBEDDING_DIM}",
                body.embedding.len()
            )));
        }
        Ok(body.embedding)
    }

    async fn is_available(&self) -> bool {
        match self.client.get(self.endpoint("api/tags")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let provider = OllamaEmbeddingProvider::new(EmbedderConfig {
            host: "http://localhost:11434/".to_string(),
            ..Default::default()
        });
        assert_eq!(provider.endpoint("/api/tags"), "http://localhost:11434/api/tags");
    }

    #[tokio::test]
    async fn unreachable_host_reports_unavailable() {
        let provider = OllamaEmbeddingProvider::new(EmbedderConfig {
            host: "http://127.0.0.1:1".to_string(),
            timeout_ms: 200,
            ..Default::default()
        });
        assert!(!provider.is_available().await);
        assert!(matches!(provider.embed("x").await, Err(CoreError::Unavailable(_))));
    }
}
