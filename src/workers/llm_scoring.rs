//! LLM scoring worker
//!
//! Owns the slow holistic page analysis so heuristic processing never
//! waits on a minute-long LLM call. Each completed page re-checks the
//! finalization predicate; the last pending page to resolve is what closes
//! the scan.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::bias::{is_biased, HolisticResult};
use crate::completion::ScanCompletionService;
use crate::db::{pages, scans};
use crate::error::Result;
use crate::progress::ProgressService;
use crate::queue::{decode, LlmScoringTask, QueueHandler};
use crate::scoring::ScoringService;

pub struct LlmScoringWorker {
    pool: PgPool,
    scoring: ScoringService,
    progress: ProgressService,
    completion: ScanCompletionService,
}

impl LlmScoringWorker {
    pub fn new(
        pool: PgPool,
        scoring: ScoringService,
        progress: ProgressService,
        completion: ScanCompletionService,
    ) -> Self {
        Self {
            pool,
            scoring,
            progress,
            completion,
        }
    }

    async fn process_llm_task(&self, task: LlmScoringTask) -> Result<()> {
        let scan_id = task.scan_id;
        info!(page_id = task.page_id, scan_id, url = %task.page_url, "holistic scoring");

        if scans::is_cancellation_requested(&self.pool, scan_id).await? {
            info!(scan_id, "scan cancelled, skipping holistic scoring");
            scans::mark_cancelled(&self.pool, scan_id).await?;
            return Ok(());
        }

        let Some(page) = pages::get_page(&self.pool, task.page_id).await? else {
            warn!(page_id = task.page_id, "page not found, may have been deleted");
            return Ok(());
        };

        match self
            .scoring
            .client()
            .score_page(&task.page_content, &task.page_url)
            .await
        {
            Ok(result) => {
                let biased = is_biased(&result);
                info!(
                    page_id = page.id,
                    bias_types = result.bias_types.len(),
                    biased,
                    "holistic score received"
                );

                let value = serde_json::to_value(&result)?;
                pages::set_holistic(&self.pool, page.id, &value).await?;
                if biased {
                    self.progress
                        .report_page_result(scan_id, &task.page_url, true, Some(value))
                        .await;
                }
            }
            Err(err) => {
                // Recorded on the page rather than retried: the scan must
                // still be able to finalize.
                warn!(page_id = page.id, %err, "holistic scoring failed");
                let value =
                    serde_json::to_value(HolisticResult::llm_error("holistic scoring failed"))?;
                pages::set_holistic(&self.pool, page.id, &value).await?;
            }
        }

        self.completion.check_and_finalize(&self.pool, scan_id).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueHandler for LlmScoringWorker {
    async fn handle(&self, payload: serde_json::Value) -> Result<()> {
        let task: LlmScoringTask = decode(&payload)?;
        self.process_llm_task(task).await
    }
}
