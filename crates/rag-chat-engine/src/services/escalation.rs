use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::EscalationConfig;
use crate::database::{NewEscalationEvent, Repository};
use crate::utils::error::EngineError;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_BODY_LIMIT: usize = 500;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(
        &self,
        session_id: Uuid,
        query: &str,
        reason: &str,
        message_id: Option<Uuid>,
    ) -> Result<(), EngineError>;
}

/// Dispatches the human-support webhook and records an append-only
/// EscalationEvent. The webhook outcome never blocks the user-visible
/// stream; transport failures are recorded as status 0.
pub struct EscalationService {
    repository: Arc<Repository>,
    client: reqwest::Client,
    config: EscalationConfig,
}

impl EscalationService {
    pub fn new(repository: Arc<Repository>, config: EscalationConfig) -> Self {
        Self {
            repository,
            client: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
        }
    }

    async fn dispatch_webhook(
        &self,
        url: &str,
        session_id: Uuid,
        query: &str,
        reason: &str,
    ) -> (i32, serde_json::Value) {
        let payload = json!({
            "session_id": session_id,
            "query": query,
            "reason": reason,
        });

        match self.client.post(url).json(&payload).send().await {
            Ok(response) => {
                let status = response.status().as_u16() as i32;
                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(RESPONSE_BODY_LIMIT)
                    .collect();
                info!(session_id = %session_id, status, "escalation_webhook_sent");
                (status, json!({ "body": body }))
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "escalation_webhook_failed");
                (0, json!({ "error": e.to_string() }))
            }
        }
    }
}

#[async_trait]
impl EscalationSink for EscalationService {
    async fn escalate(
        &self,
        session_id: Uuid,
        query: &str,
        reason: &str,
        message_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        let (webhook_status, webhook_response) = match &self.config.webhook_url {
            Some(url) if !url.is_empty() => {
                let (status, response) = self.dispatch_webhook(url, session_id, query, reason).await;
                (Some(status), Some(response))
            }
            _ => (None, None),
        };

        self.repository
            .insert_escalation_event(&NewEscalationEvent {
                session_id,
                message_id,
                reason: reason.to_string(),
                query: query.to_string(),
                webhook_status,
                webhook_response,
            })
            .await
            .map_err(|e| EngineError::Escalation(e.to_string()))?;

        Ok(())
    }
}
