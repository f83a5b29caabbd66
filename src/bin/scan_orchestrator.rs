//! Scan orchestrator daemon
//!
//! Long-running consumer of the `scan_tasks` queue. Each task triggers
//! GitHub file discovery for one repository and stages its changed files.

use docbias::completion::ScanCompletionService;
use docbias::config::Config;
use docbias::db::init_db;
use docbias::discovery::DiscoveryService;
use docbias::github::{GitHubClient, GitHubConfig};
use docbias::progress::ProgressService;
use docbias::queue::{connect_queue_pool, QueueName, QueueService};
use docbias::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use docbias::workers::ScanOrchestrator;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_telemetry(TelemetryConfig::for_worker(
        "scan-orchestrator",
        config.application.otlp_endpoint.clone(),
    ))?;

    tracing::info!("starting scan orchestrator");

    let pool = init_db(&config.database.url).await?;
    tracing::info!("database initialized");

    let queue_pool = connect_queue_pool(&config.queue, &pool).await?;
    let queue = QueueService::new(queue_pool, config.queue.clone());

    let token = Config::github_token()?;
    let github = GitHubClient::new(GitHubConfig::new(
        token,
        config.application.user_agent.clone(),
    ))?;

    let discovery = DiscoveryService::new(github, queue.clone(), config.application.clone());
    let orchestrator = ScanOrchestrator::new(
        pool,
        discovery,
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
        .consume(QueueName::ScanTasks, &orchestrator, shutdown_rx)
        .await?;

    tracing::info!("scan orchestrator stopped");
    shutdown_telemetry();
    Ok(())
}
