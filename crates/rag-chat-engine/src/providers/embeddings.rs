use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::utils::error::EngineError;

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/v1/embeddings` client. The configured dimension
/// is authoritative; every response is checked against it.
pub struct EmbeddingClient {
    client: Client,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingClient {
    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = texts.len(), model = %self.config.model, "embedding_batch");

        let expected = texts.len();
        let request = EmbeddingRequest {
            input: texts,
            model: self.config.model.clone(),
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/embeddings", self.config.base_url))
            .json(&request);

        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::provider("embeddings", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "embeddings",
                format!("API error {status}: {body}"),
            ));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EngineError::provider("embeddings", e))?;

        if body.data.len() != expected {
            return Err(EngineError::provider(
                "embeddings",
                format!("expected {expected} vectors, got {}", body.data.len()),
            ));
        }

        let mut vectors = Vec::with_capacity(body.data.len());
        for item in body.data {
            if item.embedding.len() != self.config.dimension {
                return Err(EngineError::provider(
                    "embeddings",
                    format!(
                        "dimension mismatch: expected {}, got {}",
                        self.config.dimension,
                        item.embedding.len()
                    ),
                ));
            }
            vectors.push(item.embedding);
        }

        Ok(vectors)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let mut vectors = self.embed_texts(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EngineError::provider("embeddings", "empty response for query"))
    }
}
