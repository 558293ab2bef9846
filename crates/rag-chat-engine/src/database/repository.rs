use pgvector::Vector;
use sqlx::{Error as SqlxError, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{ChatMessageRow, DbPool, Document, DocumentStatus, NewChunk, NewEscalationEvent};

pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, SqlxError> {
        self.pool.get_pool().begin().await
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    pub async fn get_document(&self, id: Uuid) -> Result<Option<Document>, SqlxError> {
        let doc = sqlx::query_as::<_, Document>(
            r#"SELECT
                id,
                title,
                source_type,
                source_uri,
                status,
                chunk_count,
                error_message,
                metadata,
                created_at,
                updated_at
               FROM documents
               WHERE id = $1"#,
        )
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(doc)
    }

    /// Committed immediately so concurrent observers see progress.
    pub async fn update_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            "UPDATE documents SET status = $2, error_message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(self.pool.get_pool())
        .await?;

        debug!(document_id = %id, status = status.as_str(), "document_status_updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chunks (transactional: all writes of one ingestion share one tx)
    // ------------------------------------------------------------------

    pub async fn delete_chunks(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        document_id: Uuid,
    ) -> Result<u64, SqlxError> {
        let result = sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn insert_chunk(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        chunk: &NewChunk,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            r#"INSERT INTO document_chunks
                (id, document_id, chunk_index, text, metadata, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, now(), now())"#,
        )
        .bind(chunk.id)
        .bind(chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.metadata)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn set_chunk_embedding(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        chunk_id: Uuid,
        embedding: Vector,
    ) -> Result<(), SqlxError> {
        sqlx::query("UPDATE document_chunks SET embedding = $2, updated_at = now() WHERE id = $1")
            .bind(chunk_id)
            .bind(embedding)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    pub async fn set_chunk_keyword_index(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        chunk_id: Uuid,
        text: &str,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            r#"UPDATE document_chunks
               SET tsv = to_tsvector('english', $2), updated_at = now()
               WHERE id = $1"#,
        )
        .bind(chunk_id)
        .bind(text)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn finalize_document(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        document_id: Uuid,
        chunk_count: i32,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            r#"UPDATE documents
               SET status = $2, chunk_count = $3, error_message = NULL, updated_at = now()
               WHERE id = $1"#,
        )
        .bind(document_id)
        .bind(DocumentStatus::Ready.as_str())
        .bind(chunk_count)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions & messages
    // ------------------------------------------------------------------

    pub async fn session_exists(&self, session_id: Uuid) -> Result<bool, SqlxError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM chat_sessions WHERE id = $1)",
        )
        .bind(session_id)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(exists)
    }

    /// Last `limit` user/assistant messages, returned in insertion order.
    pub async fn get_recent_messages(
        &self,
        session_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ChatMessageRow>, SqlxError> {
        let mut rows = sqlx::query_as::<_, ChatMessageRow>(
            r#"SELECT
                id,
                session_id,
                role,
                content,
                confidence_tier,
                sources,
                usage,
                created_at
               FROM chat_messages
               WHERE session_id = $1 AND role IN ('user', 'assistant')
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        rows.reverse();
        Ok(rows)
    }

    /// Persist an assistant turn and bump the session in one unit of work.
    pub async fn insert_assistant_message(
        &self,
        message_id: Uuid,
        session_id: Uuid,
        content: &str,
        confidence_tier: &str,
        sources: Option<&serde_json::Value>,
        usage: Option<&serde_json::Value>,
    ) -> Result<(), SqlxError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"INSERT INTO chat_messages
                (id, session_id, role, content, confidence_tier, sources, usage, created_at)
               VALUES ($1, $2, 'assistant', $3, $4, $5, $6, now())"#,
        )
        .bind(message_id)
        .bind(session_id)
        .bind(content)
        .bind(confidence_tier)
        .bind(sources)
        .bind(usage)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE chat_sessions SET updated_at = now() WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(session_id = %session_id, message_id = %message_id, "assistant_message_saved");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Escalations (append-only)
    // ------------------------------------------------------------------

    pub async fn insert_escalation_event(&self, event: &NewEscalationEvent) -> Result<(), SqlxError> {
        sqlx::query(
            r#"INSERT INTO escalation_events
                (id, session_id, message_id, reason, query, webhook_status, webhook_response, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, now())"#,
        )
        .bind(Uuid::new_v4())
        .bind(event.session_id)
        .bind(event.message_id)
        .bind(&event.reason)
        .bind(&event.query)
        .bind(event.webhook_status)
        .bind(&event.webhook_response)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }
}
