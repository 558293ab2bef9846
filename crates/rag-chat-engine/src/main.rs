use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rag_chat_engine::config::{Reloadable, Settings};
use rag_chat_engine::database::{DbPool, Repository};
use rag_chat_engine::worker::IngestionWorker;

fn init_logger() -> Result<()> {
    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,rag_chat_engine=debug".to_string());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("worker")
        .filename_suffix("log")
        .build("logs")?;

    let filter = EnvFilter::try_new(&log_level)?;

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stdout)
                        .with_target(true),
                )
                .with(fmt::layer().json().with_writer(file_appender).with_target(true))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(file_appender).with_ansi(false))
                .init();
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger()?;

    info!("starting ingestion worker");

    let settings = Settings::load()?;
    settings.validate()?;
    info!("configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    info!("database connection established");

    let repository = Arc::new(Repository::new(db_pool));
    let tuning = Arc::new(Reloadable::new(settings.tuning.clone()));

    // SIGHUP re-merges the YAML tuning overlay without a restart.
    #[cfg(unix)]
    {
        let tuning = tuning.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                match Settings::reload_tuning() {
                    Ok(fresh) => {
                        tuning.store(fresh);
                        info!("tuning configuration reloaded");
                    }
                    Err(e) => error!(error = %e, "tuning reload failed"),
                }
            }
        });
    }

    let worker = IngestionWorker::new(settings, repository, tuning);
    worker.run().await
}
