//! Changed-files worker daemon
//!
//! Long-running consumer of the `changed_files` queue. Fetches changed
//! file content, resolves the global URL lock and stages document
//! processing tasks.

use docbias::completion::ScanCompletionService;
use docbias::config::Config;
use docbias::db::init_db;
use docbias::github::{GitHubClient, GitHubConfig};
use docbias::lock::UrlLockService;
use docbias::progress::ProgressService;
use docbias::queue::{connect_queue_pool, QueueName, QueueService};
use docbias::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use docbias::workers::ChangedFilesWorker;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_telemetry(TelemetryConfig::for_worker(
        "changed-files-worker",
        config.application.otlp_endpoint.clone(),
    ))?;

    tracing::info!("starting changed-files worker");

    let pool = init_db(&config.database.url).await?;
    let queue_pool = connect_queue_pool(&config.queue, &pool).await?;
    let queue = QueueService::new(queue_pool, config.queue.clone());

    let token = Config::github_token()?;
    let github = GitHubClient::new(GitHubConfig::new(
        token,
        config.application.user_agent.clone(),
    ))?;

    let locks = UrlLockService::new(config.application.lock_timeout_minutes);
    tracing::info!(worker_id = %locks.worker_id, "lock service ready");

    let worker = ChangedFilesWorker::new(
        pool,
        github,
        queue.clone(),
        locks,
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
        .consume(QueueName::ChangedFiles, &worker, shutdown_rx)
        .await?;

    tracing::info!("changed-files worker stopped");
    shutdown_telemetry();
    Ok(())
}
