pub mod embeddings;
pub mod keyword;
pub mod llm;
pub mod reranker;
pub mod vector_store;

pub use embeddings::EmbeddingClient;
pub use keyword::PostgresFtsProvider;
pub use llm::OpenAiLlmClient;
pub use reranker::HttpReranker;
pub use vector_store::PgVectorStore;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Usage,
    pub model: String,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

/// Both retrieval modalities produce the same record shape; the fusion
/// stage joins them on `chunk_id`.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub text: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub document_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone)]
pub struct RerankResult {
    pub index: usize,
    pub score: f32,
    pub text: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<LlmMessage>,
        temperature: Option<f32>,
        max_tokens: Option<usize>,
    ) -> Result<LlmResponse, EngineError>;

    async fn stream(
        &self,
        messages: Vec<LlmMessage>,
        temperature: Option<f32>,
        max_tokens: Option<usize>,
    ) -> Result<TokenStream, EngineError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EngineError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorStoreProvider: Send + Sync {
    async fn upsert(
        &self,
        ids: Vec<Uuid>,
        embeddings: Vec<Vec<f32>>,
        texts: Vec<String>,
        metadatas: Vec<serde_json::Value>,
    ) -> Result<(), EngineError>;

    async fn search(
        &self,
        query_embedding: Vec<f32>,
        top_k: usize,
        filter: Option<SearchFilter>,
    ) -> Result<Vec<SearchHit>, EngineError>;

    async fn delete(&self, ids: Vec<Uuid>) -> Result<(), EngineError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeywordSearchProvider: Send + Sync {
    async fn index(
        &self,
        chunk_id: Uuid,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<(), EngineError>;

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<SearchFilter>,
    ) -> Result<Vec<SearchHit>, EngineError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RerankerProvider: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
        top_k: usize,
    ) -> Result<Vec<RerankResult>, EngineError>;
}
