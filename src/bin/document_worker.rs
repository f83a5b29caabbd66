//! Document worker daemon
//!
//! Long-running consumer of the `doc_processing` queue. Extracts and
//! scores code snippets, defers holistic page analysis to the LLM queue.

use std::sync::Arc;

use docbias::completion::ScanCompletionService;
use docbias::config::Config;
use docbias::db::init_db;
use docbias::lock::UrlLockService;
use docbias::progress::ProgressService;
use docbias::queue::{connect_queue_pool, QueueName, QueueService};
use docbias::scoring::{LlmRateLimiter, ScoringClient, ScoringService};
use docbias::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use docbias::workers::DocumentWorker;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_telemetry(TelemetryConfig::for_worker(
        "document-worker",
        config.application.otlp_endpoint.clone(),
    ))?;

    tracing::info!("starting document worker");

    let pool = init_db(&config.database.url).await?;
    let queue_pool = connect_queue_pool(&config.queue, &pool).await?;
    let queue = QueueService::new(queue_pool, config.queue.clone());

    let limiter = Arc::new(LlmRateLimiter::new(config.llm.requests_per_minute));
    let scoring = ScoringService::new(ScoringClient::new(config.llm.clone(), limiter)?);
    if !config.llm.is_available() {
        tracing::warn!("scoring service not configured, snippet scoring will use heuristics only");
    }

    let locks = UrlLockService::new(config.application.lock_timeout_minutes);
    tracing::info!(worker_id = %locks.worker_id, "lock service ready");

    let worker = DocumentWorker::new(
        pool,
        scoring,
        queue.clone(),
        locks,
        ProgressService::new(),
        ScanCompletionService::new(),
        config.application.max_retries,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    queue
        .consume(QueueName::DocProcessing, &worker, shutdown_rx)
        .await?;

    tracing::info!("document worker stopped");
    shutdown_telemetry();
    Ok(())
}
