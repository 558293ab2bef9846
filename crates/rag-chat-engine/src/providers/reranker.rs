use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RerankResult, RerankerProvider};
use crate::config::RerankerConfig;
use crate::utils::error::EngineError;

#[derive(Debug, Serialize)]
struct RerankRequest {
    model: String,
    query: String,
    documents: Vec<String>,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResponseItem>,
}

#[derive(Debug, Deserialize)]
struct RerankResponseItem {
    index: usize,
    relevance_score: f32,
}

/// Cross-encoder reranker behind an HTTP `/rerank` endpoint. Raw logits
/// are mapped through a logistic into (0, 1) so the confidence
/// thresholds stay well-defined.
pub struct HttpReranker {
    client: Client,
    config: RerankerConfig,
}

impl HttpReranker {
    pub fn new(config: RerankerConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[async_trait]
impl RerankerProvider for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
        top_k: usize,
    ) -> Result<Vec<RerankResult>, EngineError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        debug!(documents = documents.len(), top_k, "rerank");

        let request = RerankRequest {
            model: self.config.model.clone(),
            query: query.to_string(),
            documents: documents.clone(),
            top_n: top_k,
        };

        let mut builder = self
            .client
            .post(format!("{}/rerank", self.config.base_url))
            .json(&request);

        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::provider("reranker", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "reranker",
                format!("API error {status}: {body}"),
            ));
        }

        let body: RerankResponse = response
            .json()
            .await
            .map_err(|e| EngineError::provider("reranker", e))?;

        let mut results: Vec<RerankResult> = body
            .results
            .into_iter()
            .filter(|item| item.index < documents.len())
            .map(|item| RerankResult {
                index: item.index,
                score: if self.config.normalize_logits {
                    sigmoid(item.relevance_score)
                } else {
                    item.relevance_score
                },
                text: documents[item.index].clone(),
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_maps_logits_into_unit_interval() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[tokio::test]
    async fn empty_documents_short_circuit() {
        let reranker = HttpReranker::new(RerankerConfig {
            base_url: "http://localhost:9".into(),
            model: "m".into(),
            api_key: None,
            normalize_logits: true,
        });
        let results = reranker.rerank("q", Vec::new(), 5).await.unwrap();
        assert!(results.is_empty());
    }
}
