//! LLM scoring worker daemon
//!
//! Long-running consumer of the `llm_scoring` queue. Runs the slow
//! holistic page analysis at rate-limited speed and finalizes scans whose
//! LLM phase has drained.

use std::sync::Arc;

use docbias::completion::ScanCompletionService;
use docbias::config::Config;
use docbias::db::init_db;
use docbias::progress::ProgressService;
use docbias::queue::{connect_queue_pool, QueueName, QueueService};
use docbias::scoring::{LlmRateLimiter, ScoringClient, ScoringService};
use docbias::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use docbias::workers::LlmScoringWorker;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_telemetry(TelemetryConfig::for_worker(
        "llm-scoring-worker",
        config.application.otlp_endpoint.clone(),
    ))?;

    tracing::info!("starting LLM scoring worker");

    let pool = init_db(&config.database.url).await?;
    let queue_pool = connect_queue_pool(&config.queue, &pool).await?;
    let queue = QueueService::new(queue_pool, config.queue.clone());

    let limiter = Arc::new(LlmRateLimiter::new(config.llm.requests_per_minute));
    let scoring = ScoringService::new(ScoringClient::new(config.llm.clone(), limiter)?);

    let worker = LlmScoringWorker::new(
        pool,
        scoring,
        ProgressService::new(),
        ScanCompletionService::new(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    queue
        .consume(QueueName::LlmScoring, &worker, shutdown_rx)
        .await?;

    tracing::info!("LLM scoring worker stopped");
    shutdown_telemetry();
    Ok(())
}
