use std::sync::Arc;

use anyhow::Result;
use ::config::{Config, Environment, File, FileFormat};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::utils::error::EngineError;

/// Aggregated settings: env vars (secrets, infrastructure endpoints)
/// overlay the YAML tuning file. Merged once at startup; the tuning
/// bundle alone is re-merged on an explicit reload signal.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub reranker: RerankerConfig,
    pub escalation: EscalationConfig,
    pub ingestion: IngestionConfig,
    pub worker: WorkerConfig,
    pub tuning: TuningConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RerankerConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Apply a logistic map to raw cross-encoder logits so scores land
    /// in (0, 1). Disable for backends that already return relevance
    /// probabilities.
    #[serde(default = "default_true")]
    pub normalize_logits: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct EscalationConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct IngestionConfig {
    /// Base directory file loaders are confined to. Empty disables the
    /// path-traversal guard (dev only).
    #[serde(default)]
    pub allowed_base_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_listen_channel")]
    pub listen_channel: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            job_timeout_seconds: default_job_timeout(),
            queue_capacity: default_queue_capacity(),
            listen_channel: default_listen_channel(),
        }
    }
}

/// Behavioral tuning bundle, reloadable at runtime. Pipeline runs
/// snapshot it at entry so a concurrent reload never splits a request
/// across two versions.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TuningConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub persona: PersonaConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_top_k")]
    pub semantic_top_k: usize,
    #[serde(default = "default_keyword_top_k")]
    pub keyword_top_k: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: usize,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_top_k: default_semantic_top_k(),
            keyword_top_k: default_keyword_top_k(),
            rrf_k: default_rrf_k(),
            rerank_top_k: default_rerank_top_k(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_turns: default_max_turns(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConfidenceConfig {
    #[serde(default = "default_answer_threshold")]
    pub answer_threshold: f32,
    #[serde(default = "default_caveat_threshold")]
    pub caveat_threshold: f32,
    #[serde(default = "default_decline_threshold")]
    pub decline_threshold: f32,
    #[serde(default = "default_minimum_relevance")]
    pub minimum_relevance: f32,
    #[serde(default = "default_ambiguity_variance")]
    pub ambiguity_score_variance: f32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            answer_threshold: default_answer_threshold(),
            caveat_threshold: default_caveat_threshold(),
            decline_threshold: default_decline_threshold(),
            minimum_relevance: default_minimum_relevance(),
            ambiguity_score_variance: default_ambiguity_variance(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PersonaConfig {
    #[serde(default = "default_company_name")]
    pub company_name: String,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "default_template_path")]
    pub template_path: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            company_name: default_company_name(),
            product_name: default_product_name(),
            tone: default_tone(),
            template_path: default_template_path(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::new("config/default", FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Re-read only the YAML tuning overlay. Env-derived settings are
    /// fixed for the process lifetime.
    pub fn reload_tuning() -> Result<TuningConfig> {
        let config = Config::builder()
            .add_source(File::new("config/default", FileFormat::Yaml).required(false))
            .build()?;

        #[derive(Deserialize)]
        struct TuningOnly {
            #[serde(default)]
            tuning: TuningConfig,
        }

        let tuning: TuningOnly = config.try_deserialize()?;
        Ok(tuning.tuning)
    }

    /// Startup validation: fail fast on an inconsistent deployment.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.embedding.dimension == 0 {
            return Err(EngineError::Configuration(
                "embedding.dimension must be positive".into(),
            ));
        }

        let c = &self.tuning.confidence;
        if !(c.answer_threshold >= c.caveat_threshold
            && c.caveat_threshold >= c.decline_threshold
            && c.decline_threshold > c.minimum_relevance)
        {
            return Err(EngineError::Configuration(
                "confidence thresholds must satisfy answer >= caveat >= decline > minimum_relevance"
                    .into(),
            ));
        }

        let r = &self.tuning.retrieval;
        if r.chunk_overlap >= r.chunk_size {
            return Err(EngineError::Configuration(
                "retrieval.chunk_overlap must be smaller than retrieval.chunk_size".into(),
            ));
        }
        if r.rerank_top_k == 0 || r.semantic_top_k == 0 || r.keyword_top_k == 0 {
            return Err(EngineError::Configuration(
                "retrieval top-k parameters must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// Versioned value behind an atomic read. `snapshot` hands out the
/// current Arc; `store` swaps in a new version without disturbing
/// in-flight readers.
pub struct Reloadable<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> Reloadable<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn snapshot(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    pub fn store(&self, value: T) {
        *self.inner.write() = Arc::new(value);
    }
}

fn default_pool_max_size() -> u32 {
    20
}
fn default_pool_timeout() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> usize {
    1024
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_dimension() -> usize {
    1536
}
fn default_true() -> bool {
    true
}
fn default_max_jobs() -> usize {
    5
}
fn default_job_timeout() -> u64 {
    600
}
fn default_queue_capacity() -> usize {
    256
}
fn default_listen_channel() -> String {
    "document_ingest".to_string()
}
fn default_semantic_top_k() -> usize {
    20
}
fn default_keyword_top_k() -> usize {
    20
}
fn default_rrf_k() -> usize {
    60
}
fn default_rerank_top_k() -> usize {
    5
}
fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    64
}
fn default_max_turns() -> usize {
    10
}
fn default_answer_threshold() -> f32 {
    0.85
}
fn default_caveat_threshold() -> f32 {
    0.60
}
fn default_decline_threshold() -> f32 {
    0.35
}
fn default_minimum_relevance() -> f32 {
    0.15
}
fn default_ambiguity_variance() -> f32 {
    0.05
}
fn default_company_name() -> String {
    "our company".to_string()
}
fn default_product_name() -> String {
    "our product".to_string()
}
fn default_tone() -> String {
    "professional and helpful".to_string()
}
fn default_template_path() -> String {
    "config/persona/default.yaml".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            database: DatabaseConfig {
                url: "postgres://localhost/test".into(),
                pool_max_size: 5,
                pool_timeout_seconds: 5,
            },
            llm: LlmConfig {
                base_url: "http://localhost:8081".into(),
                model: "test-model".into(),
                api_key: None,
                temperature: 0.1,
                max_tokens: 256,
                timeout_seconds: 30,
            },
            embedding: EmbeddingConfig {
                base_url: "http://localhost:8082".into(),
                model: "test-embed".into(),
                api_key: None,
                dimension: 1536,
            },
            reranker: RerankerConfig {
                base_url: "http://localhost:8083".into(),
                model: "test-rerank".into(),
                api_key: None,
                normalize_logits: true,
            },
            escalation: EscalationConfig::default(),
            ingestion: IngestionConfig::default(),
            worker: WorkerConfig::default(),
            tuning: TuningConfig::default(),
        }
    }

    #[test]
    fn default_settings_validate() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn zero_dimension_rejected() {
        let mut s = base_settings();
        s.embedding.dimension = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let mut s = base_settings();
        s.tuning.confidence.caveat_threshold = 0.9;
        s.tuning.confidence.answer_threshold = 0.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut s = base_settings();
        s.tuning.retrieval.chunk_overlap = 512;
        assert!(s.validate().is_err());
    }

    #[test]
    fn reloadable_snapshot_is_stable_across_store() {
        let cell = Reloadable::new(TuningConfig::default());
        let before = cell.snapshot();
        let mut next = TuningConfig::default();
        next.retrieval.rrf_k = 10;
        cell.store(next);
        assert_eq!(before.retrieval.rrf_k, 60);
        assert_eq!(cell.snapshot().retrieval.rrf_k, 10);
    }
}
