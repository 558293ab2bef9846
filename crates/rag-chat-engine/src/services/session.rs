use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::database::Repository;
use crate::providers::LlmMessage;
use crate::utils::error::EngineError;

/// Persistence seam of the query pipeline: the conversation window in,
/// the finished assistant turn out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_context_messages(
        &self,
        session_id: Uuid,
        max_turns: usize,
    ) -> Result<Vec<LlmMessage>, EngineError>;

    async fn save_assistant_message(
        &self,
        session_id: Uuid,
        message_id: Uuid,
        content: &str,
        confidence_tier: &str,
        sources: Option<serde_json::Value>,
        usage: Option<serde_json::Value>,
    ) -> Result<(), EngineError>;
}

pub struct SessionManager {
    repository: Arc<Repository>,
}

impl SessionManager {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl ConversationStore for SessionManager {
    /// Last `2 * max_turns` user/assistant messages in insertion order.
    async fn get_context_messages(
        &self,
        session_id: Uuid,
        max_turns: usize,
    ) -> Result<Vec<LlmMessage>, EngineError> {
        let rows = self
            .repository
            .get_recent_messages(session_id, (max_turns * 2) as i64)
            .await?;

        debug!(session_id = %session_id, count = rows.len(), "context_loaded");

        Ok(rows
            .into_iter()
            .map(|row| LlmMessage::new(row.role, row.content))
            .collect())
    }

    async fn save_assistant_message(
        &self,
        session_id: Uuid,
        message_id: Uuid,
        content: &str,
        confidence_tier: &str,
        sources: Option<serde_json::Value>,
        usage: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        if !self.repository.session_exists(session_id).await? {
            return Err(EngineError::SessionNotFound(session_id));
        }

        self.repository
            .insert_assistant_message(
                message_id,
                session_id,
                content,
                confidence_tier,
                sources.as_ref(),
                usage.as_ref(),
            )
            .await?;

        Ok(())
    }
}
