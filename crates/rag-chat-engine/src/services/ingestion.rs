use std::sync::Arc;

use pgvector::Vector;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::database::{Document, DocumentStatus, NewChunk, Repository, SourceType};
use crate::document::{MetadataExtractor, SourceLoader, TextChunker, TextCleaner};
use crate::providers::EmbeddingProvider;
use crate::utils::error::EngineError;

const EMBED_BATCH_SIZE: usize = 100;

/// Drives load -> clean -> chunk -> embed -> index for one document.
/// Sole writer of Document status transitions: pending -> processing is
/// committed immediately, everything after runs in one transaction that
/// either lands the document at `ready` or rolls back entirely.
pub struct IngestionPipeline {
    repository: Arc<Repository>,
    embeddings: Arc<dyn EmbeddingProvider>,
    ingestion: IngestionConfig,
    chunker: TextChunker,
}

impl IngestionPipeline {
    pub fn new(
        repository: Arc<Repository>,
        embeddings: Arc<dyn EmbeddingProvider>,
        ingestion: IngestionConfig,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            repository,
            embeddings,
            ingestion,
            chunker: TextChunker::new(chunk_size, chunk_overlap),
        }
    }

    pub async fn ingest(&self, document_id: Uuid) -> Result<(), EngineError> {
        let doc = self
            .repository
            .get_document(document_id)
            .await?
            .ok_or(EngineError::DocumentNotFound(document_id))?;

        self.repository
            .update_document_status(document_id, DocumentStatus::Processing, None)
            .await?;

        match self.ingest_inner(&doc).await {
            Ok(chunk_count) => {
                info!(document_id = %document_id, chunk_count, "ingestion_complete");
                Ok(())
            }
            Err(e) => {
                error!(document_id = %document_id, error = %e, "ingestion_failed");
                // The transaction is already gone; record the failure on
                // the document row so observers see it.
                if let Err(status_err) = self
                    .repository
                    .update_document_status(document_id, DocumentStatus::Error, Some(&e.to_string()))
                    .await
                {
                    error!(document_id = %document_id, error = %status_err, "error_status_write_failed");
                }
                Err(EngineError::Ingestion(e.to_string()))
            }
        }
    }

    async fn ingest_inner(&self, doc: &Document) -> Result<usize, EngineError> {
        let source_type = SourceType::parse(&doc.source_type).ok_or_else(|| {
            EngineError::Ingestion(format!("unknown source type: {}", doc.source_type))
        })?;

        // 1. Load
        let loader = SourceLoader::for_source_type(source_type, &self.ingestion);
        let loaded = loader.load(&doc.source_uri).await?;
        info!(document_id = %doc.id, count = loaded.len(), "documents_loaded");

        // 2. Clean -> extract metadata -> chunk. chunk_index runs across
        // all loaded parts so (document_id, chunk_index) stays unique.
        let mut chunks: Vec<NewChunk> = Vec::new();
        for loaded_doc in &loaded {
            let cleaned = TextCleaner::clean(&loaded_doc.text);

            let mut doc_metadata =
                MetadataExtractor::extract(&cleaned, &doc.source_uri, source_type);
            if let (Some(target), Some(extra)) =
                (doc_metadata.as_object_mut(), loaded_doc.metadata.as_object())
            {
                for (key, value) in extra {
                    target.insert(key.clone(), value.clone());
                }
            }

            for piece in self.chunker.chunk(&cleaned, &doc_metadata) {
                chunks.push(NewChunk {
                    id: Uuid::new_v4(),
                    document_id: doc.id,
                    chunk_index: chunks.len() as i32,
                    text: piece.text,
                    metadata: piece.metadata,
                });
            }
        }
        info!(document_id = %doc.id, chunk_count = chunks.len(), "document_chunked");

        // 3. Persist chunk rows, embed in batches, build the keyword
        // index, finalize. One transaction for the lot.
        let mut tx = self.repository.begin().await?;

        let deleted = self.repository.delete_chunks(&mut tx, doc.id).await?;
        if deleted > 0 {
            info!(document_id = %doc.id, deleted, "existing_chunks_replaced");
        }

        for chunk in &chunks {
            self.repository.insert_chunk(&mut tx, chunk).await?;
        }

        for (batch_index, batch) in chunks.chunks(EMBED_BATCH_SIZE).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embeddings.embed_texts(texts).await?;

            if vectors.len() != batch.len() {
                return Err(EngineError::provider(
                    "embeddings",
                    format!("expected {} vectors, got {}", batch.len(), vectors.len()),
                ));
            }

            for (chunk, vector) in batch.iter().zip(vectors) {
                if vector.len() != self.embeddings.dimension() {
                    return Err(EngineError::provider(
                        "embeddings",
                        format!(
                            "dimension mismatch: expected {}, got {}",
                            self.embeddings.dimension(),
                            vector.len()
                        ),
                    ));
                }
                self.repository
                    .set_chunk_embedding(&mut tx, chunk.id, Vector::from(vector))
                    .await?;
            }

            info!(
                document_id = %doc.id,
                batch_start = batch_index * EMBED_BATCH_SIZE,
                batch_size = batch.len(),
                "batch_embedded"
            );
        }

        for chunk in &chunks {
            self.repository
                .set_chunk_keyword_index(&mut tx, chunk.id, &chunk.text)
                .await?;
        }

        self.repository
            .finalize_document(&mut tx, doc.id, chunks.len() as i32)
            .await?;

        tx.commit().await?;

        Ok(chunks.len())
    }
}
