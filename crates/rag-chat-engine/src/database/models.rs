use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Document lifecycle. The ingestion orchestrator is the sole writer of
/// these transitions: pending -> processing -> ready | error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Markdown,
    Pdf,
    Web,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Markdown => "markdown",
            SourceType::Pdf => "pdf",
            SourceType::Web => "web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "markdown" => Some(SourceType::Markdown),
            "pdf" => Some(SourceType::Pdf),
            "web" => Some(SourceType::Web),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub source_type: String,
    pub source_uri: String,
    pub status: String,
    pub chunk_count: i32,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Chunk row as written during ingestion. Embedding and tsv live in the
/// same table but are only touched through the repository update paths.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub text: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChatMessageRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
    pub confidence_tier: Option<String>,
    pub sources: Option<serde_json::Value>,
    pub usage: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEscalationEvent {
    pub session_id: Uuid,
    pub message_id: Option<Uuid>,
    pub reason: String,
    pub query: String,
    pub webhook_status: Option<i32>,
    pub webhook_response: Option<serde_json::Value>,
}
