use async_trait::async_trait;
use pgvector::Vector;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::{SearchFilter, SearchHit, VectorStoreProvider};
use crate::database::DbPool;
use crate::utils::error::EngineError;

#[derive(FromRow)]
struct VectorRow {
    id: Uuid,
    text: String,
    metadata: serde_json::Value,
    score: f32,
}

/// pgvector-backed store over the `document_chunks` table. Cosine
/// distance, score = 1 - distance.
pub struct PgVectorStore {
    pool: DbPool,
}

impl PgVectorStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStoreProvider for PgVectorStore {
    async fn upsert(
        &self,
        ids: Vec<Uuid>,
        embeddings: Vec<Vec<f32>>,
        _texts: Vec<String>,
        _metadatas: Vec<serde_json::Value>,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.get_pool().begin().await?;

        for (id, embedding) in ids.into_iter().zip(embeddings.into_iter()) {
            sqlx::query(
                "UPDATE document_chunks SET embedding = $2, updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(Vector::from(embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        query_embedding: Vec<f32>,
        top_k: usize,
        filter: Option<SearchFilter>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let vector = Vector::from(query_embedding);
        let document_ids = filter.and_then(|f| f.document_ids);

        let rows = if let Some(ids) = document_ids {
            sqlx::query_as::<_, VectorRow>(
                r#"SELECT
                    id,
                    text,
                    metadata,
                    (1 - (embedding <=> $1))::float4 AS score
                   FROM document_chunks
                   WHERE embedding IS NOT NULL AND document_id = ANY($3)
                   ORDER BY embedding <=> $1
                   LIMIT $2"#,
            )
            .bind(vector)
            .bind(top_k as i64)
            .bind(ids)
            .fetch_all(self.pool.get_pool())
            .await?
        } else {
            sqlx::query_as::<_, VectorRow>(
                r#"SELECT
                    id,
                    text,
                    metadata,
                    (1 - (embedding <=> $1))::float4 AS score
                   FROM document_chunks
                   WHERE embedding IS NOT NULL
                   ORDER BY embedding <=> $1
                   LIMIT $2"#,
            )
            .bind(vector)
            .bind(top_k as i64)
            .fetch_all(self.pool.get_pool())
            .await?
        };

        debug!(hits = rows.len(), "vector_search");

        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                chunk_id: row.id,
                text: row.text,
                score: row.score,
                metadata: row.metadata,
            })
            .collect())
    }

    async fn delete(&self, ids: Vec<Uuid>) -> Result<(), EngineError> {
        sqlx::query("UPDATE document_chunks SET embedding = NULL, updated_at = now() WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.pool.get_pool())
            .await?;

        Ok(())
    }
}
