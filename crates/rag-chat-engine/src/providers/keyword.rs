use async_trait::async_trait;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::{KeywordSearchProvider, SearchFilter, SearchHit};
use crate::database::DbPool;
use crate::utils::error::EngineError;

#[derive(FromRow)]
struct FtsRow {
    id: Uuid,
    text: String,
    metadata: serde_json::Value,
    score: f32,
}

/// Postgres full-text search over the chunk tsvector column.
/// `ts_rank` scores are monotone but not comparable to cosine scores;
/// fusion happens on ranks, not values.
pub struct PostgresFtsProvider {
    pool: DbPool,
}

impl PostgresFtsProvider {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeywordSearchProvider for PostgresFtsProvider {
    async fn index(
        &self,
        chunk_id: Uuid,
        text: &str,
        _metadata: serde_json::Value,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"UPDATE document_chunks
               SET tsv = to_tsvector('english', $2), updated_at = now()
               WHERE id = $1"#,
        )
        .bind(chunk_id)
        .bind(text)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<SearchFilter>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let document_ids = filter.and_then(|f| f.document_ids);

        let rows = if let Some(ids) = document_ids {
            sqlx::query_as::<_, FtsRow>(
                r#"SELECT
                    id,
                    text,
                    metadata,
                    ts_rank(tsv, plainto_tsquery('english', $1))::float4 AS score
                   FROM document_chunks
                   WHERE tsv @@ plainto_tsquery('english', $1) AND document_id = ANY($3)
                   ORDER BY score DESC
                   LIMIT $2"#,
            )
            .bind(query)
            .bind(top_k as i64)
            .bind(ids)
            .fetch_all(self.pool.get_pool())
            .await?
        } else {
            sqlx::query_as::<_, FtsRow>(
                r#"SELECT
                    id,
                    text,
                    metadata,
                    ts_rank(tsv, plainto_tsquery('english', $1))::float4 AS score
                   FROM document_chunks
                   WHERE tsv @@ plainto_tsquery('english', $1)
                   ORDER BY score DESC
                   LIMIT $2"#,
            )
            .bind(query)
            .bind(top_k as i64)
            .fetch_all(self.pool.get_pool())
            .await?
        };

        debug!(hits = rows.len(), "keyword_search");

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
}
