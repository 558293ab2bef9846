use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Ingestion failed: {0}")]
    Ingestion(String),

    #[error("Provider '{provider}' failure: {cause}")]
    Provider { provider: &'static str, cause: String },

    #[error("Escalation failed: {0}")]
    Escalation(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid query: {0}")]
    Validation(String),

    #[error("Path escapes allowed base directory: {0}")]
    PathTraversal(String),

    #[error("URL blocked by SSRF policy: {0}")]
    SsrfViolation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for provider failures, keeps call sites short.
    pub fn provider(provider: &'static str, cause: impl std::fmt::Display) -> Self {
        EngineError::Provider {
            provider,
            cause: cause.to_string(),
        }
    }
}
