//! Document worker
//!
//! Processes one staged document: extract code snippets, run heuristic and
//! batched LLM scoring, then defer the slow holistic page analysis to the
//! `llm_scoring` queue so this worker stays fast. The page leaves
//! `processing` on every path with its lock mirror cleared and the URL
//! lock released.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::bias::HolisticResult;
use crate::completion::ScanCompletionService;
use crate::db::core::{Page, PageStatus};
use crate::db::{pages, scans};
use crate::error::Result;
use crate::extract::{extract_html_snippets, extract_markdown_snippets};
use crate::lock::UrlLockService;
use crate::progress::ProgressService;
use crate::queue::{
    decode, DocProcessingTask, LlmScoringTask, QueueHandler, QueueName, QueueService,
};
use crate::scoring::{ScoringService, ScoringSnippet};

pub struct DocumentWorker {
    pool: PgPool,
    scoring: ScoringService,
    queue: QueueService,
    locks: UrlLockService,
    progress: ProgressService,
    completion: ScanCompletionService,
    max_retries: i32,
}

impl DocumentWorker {
    pub fn new(
        pool: PgPool,
        scoring: ScoringService,
        queue: QueueService,
        locks: UrlLockService,
        progress: ProgressService,
        completion: ScanCompletionService,
        max_retries: i32,
    ) -> Self {
        Self {
            pool,
            scoring,
            queue,
            locks,
            progress,
            completion,
            max_retries,
        }
    }

    async fn process_document(&self, task: DocProcessingTask) -> Result<()> {
        let scan_id = task.scan_id;
        info!(page_id = task.page_id, scan_id, url = %task.url, "processing document");

        if scans::is_cancellation_requested(&self.pool, scan_id).await? {
            info!(scan_id, "scan cancelled, skipping document");
            scans::mark_cancelled(&self.pool, scan_id).await?;
            return Ok(());
        }

        let Some(page) = pages::get_page(&self.pool, task.page_id).await? else {
            warn!(page_id = task.page_id, "page not found, may have been deleted");
            return Ok(());
        };

        // Idempotency: replayed messages for settled pages are no-ops.
        match page.status() {
            Some(PageStatus::Processed) => {
                info!(url = %task.url, "page already processed");
                return Ok(());
            }
            Some(PageStatus::Error) => {
                if page.retry_count < self.max_retries {
                    info!(
                        url = %task.url,
                        attempt = page.retry_count + 1,
                        max = self.max_retries,
                        "retrying errored page"
                    );
                    pages::reset_for_retry(&self.pool, page.id).await?;
                } else {
                    warn!(url = %task.url, "page exceeded max retries, giving up");
                    return Ok(());
                }
            }
            _ => {}
        }

        // The URL lock is best effort: a lost or expired lock is logged
        // and processing proceeds; content-hash idempotency keeps the
        // duplicate work safe.
        let content_hash = page.content_hash.clone().unwrap_or_else(|| {
            warn!(url = %task.url, "page missing content hash");
            "unknown".to_string()
        });
        match self
            .locks
            .is_locked(&self.pool, &task.url, &content_hash)
            .await?
        {
            Some(holder) if holder == scan_id => {}
            other => {
                warn!(url = %task.url, ?other, "no valid processing lock held, proceeding anyway");
            }
        }

        pages::begin_processing(
            &self.pool,
            page.id,
            &self.locks.worker_id,
            Utc::now() + self.locks.lock_timeout(),
        )
        .await?;

        let result = self.analyze_document(&page, &task).await;

        match result {
            Ok(snippet_count) => {
                pages::finish_processing(&self.pool, page.id, true).await?;
                self.locks
                    .release(&self.pool, &task.url, &content_hash, scan_id, true)
                    .await?;
                info!(url = %task.url, snippet_count, "document processed");

                let processed =
                    pages::count_with_status(&self.pool, scan_id, PageStatus::Processed).await?;
                self.progress
                    .update_phase_progress(
                        &self.pool,
                        scan_id,
                        processed,
                        None,
                        Some(&task.url),
                        None,
                    )
                    .await?;

                self.refresh_and_check_completion(scan_id).await?;
                Ok(())
            }
            Err(err) => {
                pages::finish_processing(&self.pool, page.id, false).await?;
                self.locks
                    .release(&self.pool, &task.url, &content_hash, scan_id, false)
                    .await?;
                self.refresh_and_check_completion(scan_id).await?;
                Err(err)
            }
        }
    }

    /// Extract, score and defer holistic analysis. Returns snippet count.
    async fn analyze_document(&self, page: &Page, task: &DocProcessingTask) -> Result<usize> {
        let extracted = if task.source == "web" {
            extract_html_snippets(&task.file_content)
        } else {
            extract_markdown_snippets(&task.file_content)
        };

        let mut snippets = Vec::with_capacity(extracted.len());
        for snippet in &extracted {
            let row =
                pages::insert_snippet(&self.pool, page.id, &snippet.context, &snippet.code).await?;
            snippets.push(ScoringSnippet {
                id: row.id,
                code: snippet.code.clone(),
                context: snippet.context.clone(),
                language: snippet.language.clone(),
                url: task.url.clone(),
                under_az_powershell_tab: snippet.under_az_powershell_tab,
                windows_header: snippet.windows_header,
            });
        }
        info!(url = %task.url, count = snippets.len(), "extracted code snippets");

        if !snippets.is_empty() {
            let flagged = self.scoring.apply_heuristic_scoring(&snippets);
            // Nothing flagged means the heuristics saw nothing obvious;
            // the LLM still reviews everything rather than nothing.
            let targets: Vec<&ScoringSnippet> = if flagged.is_empty() {
                snippets.iter().collect()
            } else {
                flagged
            };

            let scored = self.scoring.score_snippets(&targets).await?;
            for (snippet_id, score) in scored {
                pages::set_snippet_score(&self.pool, snippet_id, &score).await?;
                if score.get("windows_biased").and_then(|v| v.as_bool()) == Some(true) {
                    self.progress
                        .report_page_result(task.scan_id, &task.url, true, Some(score))
                        .await;
                }
            }
        }

        // Holistic page scoring takes on the order of a minute; park it on
        // the LLM queue and leave a pending marker the finalization
        // predicate understands.
        let llm_task = LlmScoringTask {
            scan_id: task.scan_id,
            page_id: page.id,
            page_url: task.url.clone(),
            page_content: task.file_content.clone(),
        };
        self.queue.publish(QueueName::LlmScoring, &llm_task).await?;
        pages::set_holistic(
            &self.pool,
            page.id,
            &serde_json::to_value(HolisticResult::pending())?,
        )
        .await?;

        Ok(snippets.len())
    }

    async fn refresh_and_check_completion(&self, scan_id: i64) -> Result<()> {
        scans::refresh_files_completed(&self.pool, scan_id).await?;
        self.completion.check_and_finalize(&self.pool, scan_id).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueHandler for DocumentWorker {
    async fn handle(&self, payload: serde_json::Value) -> Result<()> {
        let task: DocProcessingTask = decode(&payload)?;
        self.process_document(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoring_snippet_carries_extraction_flags() {
        let extracted = extract_html_snippets(
            r#"<div data-tab="azure-powershell"><pre>Get-AzVM</pre></div>"#,
        );
        assert_eq!(extracted.len(), 1);
        let snippet = ScoringSnippet {
            id: 1,
            code: extracted[0].code.clone(),
            context: extracted[0].context.clone(),
            language: None,
            url: "https://github.com/o/r/blob/main/a.md".into(),
            under_az_powershell_tab: extracted[0].under_az_powershell_tab,
            windows_header: extracted[0].windows_header,
        };
        // The tab exemption must survive into scoring.
        assert!(!crate::scoring::is_windows_biased(&snippet));
    }
}
