//! Scan orchestrator
//!
//! Consumes `scan_tasks` and drives the discovery phase for one repository.
//! After discovery the orchestrator only sets the file counters and steps
//! back; the per-file workers carry the scan to completion.

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::completion::ScanCompletionService;
use crate::db::core::ScanStatus;
use crate::db::scans;
use crate::discovery::DiscoveryService;
use crate::error::{Error, Result};
use crate::progress::ProgressService;
use crate::queue::{decode, QueueHandler, ScanTask};

pub struct ScanOrchestrator {
    pool: PgPool,
    discovery: DiscoveryService,
    progress: ProgressService,
    completion: ScanCompletionService,
}

impl ScanOrchestrator {
    pub fn new(
        pool: PgPool,
        discovery: DiscoveryService,
        progress: ProgressService,
        completion: ScanCompletionService,
    ) -> Self {
        Self {
            pool,
            discovery,
            progress,
            completion,
        }
    }

    async fn process_scan(&self, task: ScanTask) -> Result<()> {
        let scan_id = task.scan_id;
        info!(scan_id, url = %task.url, force_rescan = task.force_rescan, "processing scan task");

        if scans::get_scan(&self.pool, scan_id).await?.is_none() {
            return Err(Error::Validation(format!("scan {scan_id} not found")));
        }

        if scans::is_cancellation_requested(&self.pool, scan_id).await? {
            info!(scan_id, "scan cancelled before discovery");
            scans::mark_cancelled(&self.pool, scan_id).await?;
            return Ok(());
        }

        self.progress
            .start_phase(
                &self.pool,
                scan_id,
                "discovery",
                Some(json!({
                    "description": "Discovering changed files using GitHub APIs",
                    "github_url": task.url,
                })),
            )
            .await?;

        let outcome = match self
            .discovery
            .discover_changes(&self.pool, &task.url, scan_id, task.force_rescan)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                self.progress
                    .report_error(
                        &self.pool,
                        scan_id,
                        &format!("GitHub discovery failed: {err}"),
                        None,
                    )
                    .await?;
                scans::mark_error(&self.pool, scan_id).await?;
                return Ok(());
            }
        };

        if scans::is_cancellation_requested(&self.pool, scan_id).await? {
            info!(scan_id, "scan cancelled after discovery");
            scans::mark_cancelled(&self.pool, scan_id).await?;
            return Ok(());
        }

        if outcome.files_queued == 0 {
            if task.force_rescan {
                // A forced rescan that finds nothing means discovery broke.
                self.progress
                    .report_error(
                        &self.pool,
                        scan_id,
                        "No files discovered from GitHub repository",
                        None,
                    )
                    .await?;
                scans::mark_error(&self.pool, scan_id).await?;
                return Ok(());
            }

            info!(scan_id, "no changes detected since last scan");
            scans::complete_with_no_changes(&self.pool, scan_id).await?;
            self.progress
                .complete_phase(
                    &self.pool,
                    scan_id,
                    "discovery",
                    Some(json!({
                        "files_discovered": 0,
                        "files_queued": 0,
                        "reason": "no_changes_detected",
                    })),
                )
                .await?;
            return Ok(());
        }

        self.progress
            .complete_phase(
                &self.pool,
                scan_id,
                "discovery",
                Some(json!({
                    "files_discovered": outcome.files_queued,
                    "files_queued": outcome.files_queued,
                    "discovery_type": outcome.discovery_type,
                })),
            )
            .await?;

        info!(
            scan_id,
            files_queued = outcome.files_queued,
            "files queued; scan completes when all files are processed"
        );
        scans::set_status(&self.pool, scan_id, ScanStatus::Processing).await?;
        scans::set_file_counters(&self.pool, scan_id, outcome.files_queued, outcome.files_queued, 0)
            .await?;

        // File workers may already have finished everything while the
        // counters were unset; re-run the predicate so the scan cannot
        // strand in `processing`.
        scans::refresh_files_completed(&self.pool, scan_id).await?;
        self.completion.check_and_finalize(&self.pool, scan_id).await?;

        Ok(())
    }
}

#[async_trait]
impl QueueHandler for ScanOrchestrator {
    async fn handle(&self, payload: serde_json::Value) -> Result<()> {
        let task: ScanTask = decode(&payload)?;
        if let Err(err) = self.process_scan(task.clone()).await {
            warn!(scan_id = task.scan_id, %err, "scan task failed");
            return Err(err);
        }
        Ok(())
    }
}
