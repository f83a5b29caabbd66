//! Changed-files worker
//!
//! Turns a per-file change notification into a staged document-processing
//! task: fetch the content, claim the global URL lock, upsert the page row
//! and hand the body to `doc_processing`. Every exit path updates the
//! file-completion counters and re-checks the finalization predicate, so
//! the scan closes no matter which worker touches the last file.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::time::Instant;
use tracing::{info, warn};

use crate::completion::ScanCompletionService;
use crate::db::core::PageStatus;
use crate::db::{pages, scans};
use crate::error::{Error, Result};
use crate::github::{
    is_windows_focused_content, is_windows_focused_path, ChangeType, GitHubClient,
};
use crate::history::{ProcessingHistoryService, ProcessingResult};
use crate::lock::{LockOutcome, UrlLockService};
use crate::progress::ProgressService;
use crate::queue::{decode, ChangedFileMessage, DocProcessingTask, QueueHandler, QueueName, QueueService};

pub struct ChangedFilesWorker {
    pool: PgPool,
    github: GitHubClient,
    queue: QueueService,
    locks: UrlLockService,
    history: ProcessingHistoryService,
    progress: ProgressService,
    completion: ScanCompletionService,
}

impl ChangedFilesWorker {
    pub fn new(
        pool: PgPool,
        github: GitHubClient,
        queue: QueueService,
        locks: UrlLockService,
        progress: ProgressService,
        completion: ScanCompletionService,
    ) -> Self {
        Self {
            pool,
            github,
            queue,
            locks,
            history: ProcessingHistoryService,
            progress,
            completion,
        }
    }

    async fn process_file_change(&self, msg: ChangedFileMessage) -> Result<()> {
        let scan_id = msg.scan_id;
        let started = Instant::now();
        info!(scan_id, path = %msg.path, change_type = ?msg.change_type, "processing file change");

        if scans::is_cancellation_requested(&self.pool, scan_id).await? {
            info!(scan_id, "scan cancelled, skipping file");
            scans::mark_cancelled(&self.pool, scan_id).await?;
            return Ok(());
        }

        let scan = scans::get_scan(&self.pool, scan_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("scan {scan_id} not found")))?;
        let repo_url = scan
            .url
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("scan {scan_id} has no repository URL")))?;
        let parsed = GitHubClient::parse_github_url(repo_url)?;

        let github_url = GitHubClient::blob_url(&parsed.repo_full_name, &parsed.branch, &msg.path);

        if is_windows_focused_path(&github_url) {
            info!(%github_url, "skipping Windows-focused file");
            return Ok(());
        }

        // Replay guard: once a page is settled for this file version, a
        // redelivered message must not disturb it.
        if let Some(existing) = pages::find_page(&self.pool, scan_id, &github_url).await? {
            let settled = matches!(
                existing.status(),
                Some(
                    PageStatus::Processed
                        | PageStatus::Removed
                        | PageStatus::SkippedLocked
                        | PageStatus::SkippedNoChange
                )
            );
            if settled && existing.github_sha.as_deref() == Some(msg.sha.as_str()) {
                info!(%github_url, status = %existing.status, "page already settled, ignoring replay");
                return Ok(());
            }
        }

        if msg.change_type == ChangeType::Removed {
            return self.handle_removed_file(scan_id, &github_url).await;
        }

        let content = match self
            .github
            .file_content(&parsed.repo_full_name, &msg.path, &parsed.branch)
            .await
        {
            Ok(content) => content,
            Err(Error::NotFound(_)) => {
                // File vanished between discovery and fetch.
                warn!(path = %msg.path, "file no longer present, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if is_windows_focused_content(&content) {
            info!(path = %msg.path, "skipping Windows-focused content");
            return Ok(());
        }

        self.history
            .record_start(
                &self.pool,
                &msg.path,
                &msg.sha,
                scan_id,
                &self.locks.worker_id,
                msg.commit_sha.as_deref(),
            )
            .await?;

        let content_hash = hex::encode(Sha256::digest(content.as_bytes()));
        let page =
            pages::upsert_discovered_page(&self.pool, scan_id, &github_url, &msg.sha, &content_hash)
                .await?;

        let outcome = self
            .locks
            .acquire(&self.pool, &github_url, &content_hash, scan_id)
            .await?;
        if !outcome.is_acquired() {
            return self
                .handle_lock_refusal(&msg, page.id, &github_url, outcome, started)
                .await;
        }

        let task = DocProcessingTask {
            page_id: page.id,
            scan_id,
            url: github_url.clone(),
            file_content: content,
            source: "github".to_string(),
        };

        match self.queue.publish(QueueName::DocProcessing, &task).await {
            Ok(()) => {
                pages::set_status(&self.pool, page.id, PageStatus::Queued).await?;
                self.history
                    .record_completion(
                        &self.pool,
                        &msg.path,
                        &msg.sha,
                        scan_id,
                        ProcessingResult::Queued,
                        started.elapsed().as_millis() as i64,
                        0,
                        false,
                        None,
                    )
                    .await?;
                info!(%github_url, "queued document for processing");
            }
            Err(err) => {
                // Without a processing task the lock must not outlive us.
                warn!(%github_url, %err, "failed to queue document, releasing lock");
                self.locks
                    .release(&self.pool, &github_url, &content_hash, scan_id, false)
                    .await?;
                pages::set_status(&self.pool, page.id, PageStatus::QueueFailed).await?;
                self.history
                    .record_completion(
                        &self.pool,
                        &msg.path,
                        &msg.sha,
                        scan_id,
                        ProcessingResult::Failed,
                        started.elapsed().as_millis() as i64,
                        0,
                        false,
                        Some("failed to queue document for processing"),
                    )
                    .await?;
            }
        }

        self.refresh_and_check_completion(scan_id).await
    }

    async fn handle_removed_file(&self, scan_id: i64, github_url: &str) -> Result<()> {
        match pages::find_page(&self.pool, scan_id, github_url).await? {
            Some(page) => {
                pages::set_status(&self.pool, page.id, PageStatus::Removed).await?;
                info!(%github_url, "marked page as removed");
            }
            None => {
                info!(%github_url, "no existing page for deleted file");
            }
        }
        self.refresh_and_check_completion(scan_id).await
    }

    async fn handle_lock_refusal(
        &self,
        msg: &ChangedFileMessage,
        page_id: i64,
        github_url: &str,
        outcome: LockOutcome,
        started: Instant,
    ) -> Result<()> {
        let reason = outcome.reason();
        info!(%github_url, %reason, "could not acquire processing lock");

        let status = match outcome {
            LockOutcome::ContentUnchanged | LockOutcome::RecentlyProcessed => {
                PageStatus::SkippedNoChange
            }
            _ => PageStatus::SkippedLocked,
        };
        pages::set_status(&self.pool, page_id, status).await?;

        // Note the winner in the scan's error log so contention is visible
        // on the scan detail view.
        if let LockOutcome::HeldByScan(_) = outcome {
            self.progress
                .tracker()
                .report_error(
                    &self.pool,
                    msg.scan_id,
                    &format!("skipped {github_url}: {reason}"),
                    None,
                )
                .await?;
        }

        self.history
            .record_completion(
                &self.pool,
                &msg.path,
                &msg.sha,
                msg.scan_id,
                ProcessingResult::Skipped,
                started.elapsed().as_millis() as i64,
                0,
                false,
                Some(&reason),
            )
            .await?;

        self.refresh_and_check_completion(msg.scan_id).await
    }

    async fn refresh_and_check_completion(&self, scan_id: i64) -> Result<()> {
        scans::refresh_files_completed(&self.pool, scan_id).await?;
        self.completion.check_and_finalize(&self.pool, scan_id).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueHandler for ChangedFilesWorker {
    async fn handle(&self, payload: serde_json::Value) -> Result<()> {
        let msg: ChangedFileMessage = decode(&payload)?;
        self.process_file_change(msg).await
    }
}
