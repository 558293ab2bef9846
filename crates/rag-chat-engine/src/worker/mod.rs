pub mod queue;

pub use queue::JobQueue;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Reloadable, Settings, TuningConfig};
use crate::database::Repository;
use crate::providers::EmbeddingClient;
use crate::services::ingestion::IngestionPipeline;

/// Background worker: dequeues ingestion jobs, runs the orchestrator,
/// manages the job lifecycle. Jobs arrive over a Postgres NOTIFY channel
/// carrying the document id; `queue()` doubles as the inline intake for
/// tests.
pub struct IngestionWorker {
    settings: Settings,
    repository: Arc<Repository>,
    queue: Arc<JobQueue>,
    slots: Arc<Semaphore>,
    tuning: Arc<Reloadable<TuningConfig>>,
}

impl IngestionWorker {
    pub fn new(
        settings: Settings,
        repository: Arc<Repository>,
        tuning: Arc<Reloadable<TuningConfig>>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(settings.worker.queue_capacity));
        let slots = Arc::new(Semaphore::new(settings.worker.max_jobs));

        Self {
            settings,
            repository,
            queue,
            slots,
            tuning,
        }
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    /// Main worker loop. Returns after a shutdown signal once in-flight
    /// jobs have drained and the pool is closed.
    pub async fn run(self) -> Result<()> {
        let mut listener = PgListener::connect_with(self.repository.pool().get_pool()).await?;
        listener.listen(&self.settings.worker.listen_channel).await?;

        info!(
            channel = %self.settings.worker.listen_channel,
            max_jobs = self.settings.worker.max_jobs,
            "ingestion worker started"
        );

        let dispatcher = self.spawn_dispatcher();

        loop {
            tokio::select! {
                notification = listener.recv() => {
                    match notification {
                        Ok(notification) => {
                            match Uuid::parse_str(notification.payload()) {
                                Ok(document_id) => {
                                    if self.queue.enqueue(document_id).await {
                                        info!(document_id = %document_id, "ingestion_job_enqueued");
                                    } else {
                                        warn!(document_id = %document_id, "ingestion_job_dropped");
                                    }
                                }
                                Err(_) => {
                                    warn!(payload = notification.payload(), "invalid ingest notification");
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "notification listener error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        info!("draining in-flight ingestion jobs");
        dispatcher.abort();

        // All permits back means all jobs finished.
        let _ = self
            .slots
            .acquire_many(self.settings.worker.max_jobs as u32)
            .await;

        self.repository.pool().close().await;
        info!("ingestion worker stopped");
        Ok(())
    }

    fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let slots = self.slots.clone();
        let repository = self.repository.clone();
        let settings = self.settings.clone();
        let tuning = self.tuning.clone();

        tokio::spawn(async move {
            loop {
                let Some(document_id) = queue.dequeue().await else {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                };

                let permit = match slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let repository = repository.clone();
                let settings = settings.clone();
                let tuning = tuning.snapshot();

                tokio::spawn(async move {
                    let _permit = permit;

                    // Fresh embedding client per job.
                    let embeddings = Arc::new(EmbeddingClient::new(settings.embedding.clone()));
                    let pipeline = IngestionPipeline::new(
                        repository,
                        embeddings,
                        settings.ingestion.clone(),
                        tuning.retrieval.chunk_size,
                        tuning.retrieval.chunk_overlap,
                    );

                    let timeout = Duration::from_secs(settings.worker.job_timeout_seconds);
                    match tokio::time::timeout(timeout, pipeline.ingest(document_id)).await {
                        Ok(Ok(())) => {
                            info!(document_id = %document_id, "ingestion_job_done");
                        }
                        Ok(Err(e)) => {
                            // The orchestrator already recorded the error
                            // on the document row; log and move on.
                            error!(document_id = %document_id, error = %e, "ingestion_job_failed");
                        }
                        Err(_) => {
                            error!(
                                document_id = %document_id,
                                timeout_seconds = settings.worker.job_timeout_seconds,
                                "ingestion_job_timeout"
                            );
                        }
                    }
                });
            }
        })
    }
}
