//! Scan finalization
//!
//! A scan closes only when file processing AND the asynchronous LLM phase
//! have both drained:
//!
//! 1. the scan is not already completed,
//! 2. `total_files_queued > 0` and `total_files_completed` has caught up,
//! 3. no page still carries `review_method = "llm_pending"`.
//!
//! The check runs under `SELECT ... FOR UPDATE` on the scan row, so
//! concurrent callers converge: the first to observe the predicate performs
//! the write, later callers see `completed` and no-op. Calling it after
//! every task completion is therefore safe and is exactly what the workers
//! do.

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::bias::is_biased_value;
use crate::db::core::Scan;
use crate::error::Result;
use crate::snapshots::BiasSnapshotService;

#[derive(Clone, Default)]
pub struct ScanCompletionService {
    snapshots: BiasSnapshotService,
}

impl ScanCompletionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalize the scan if the completion predicate holds. Returns whether
    /// this call performed the finalization.
    pub async fn check_and_finalize(&self, pool: &PgPool, scan_id: i64) -> Result<bool> {
        let mut tx = pool.begin().await?;

        let scan: Option<Scan> =
            sqlx::query_as("SELECT * FROM scans WHERE id = $1 FOR UPDATE")
                .bind(scan_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(scan) = scan else {
            return Ok(false);
        };

        if scan.status == "completed" {
            return Ok(false);
        }
        // Cancelled and errored scans stay where they are.
        if scan.status == "cancelled" || scan.status == "error" {
            return Ok(false);
        }

        if scan.total_files_queued == 0 || scan.total_files_completed < scan.total_files_queued {
            return Ok(false);
        }

        let (pending_llm,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM pages
            WHERE scan_id = $1 AND mcp_holistic ->> 'review_method' = 'llm_pending'
            "#,
        )
        .bind(scan_id)
        .fetch_one(&mut *tx)
        .await?;
        if pending_llm > 0 {
            debug!(scan_id, pending_llm, "scan still waiting on LLM scoring");
            return Ok(false);
        }

        // Aggregate counters, with the severity rule applied in one place.
        let holistic_rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT mcp_holistic FROM pages WHERE scan_id = $1 AND mcp_holistic IS NOT NULL",
        )
        .bind(scan_id)
        .fetch_all(&mut *tx)
        .await?;
        let biased_pages_count = holistic_rows
            .iter()
            .filter(|(value,)| is_biased_value(value))
            .count() as i64;

        let (flagged_snippets_count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM snippets s
            JOIN pages p ON s.page_id = p.id
            WHERE p.scan_id = $1 AND s.llm_score IS NOT NULL
            "#,
        )
        .bind(scan_id)
        .fetch_one(&mut *tx)
        .await?;

        // Promote the working commit so the next scan has a complete
        // baseline; this is the only place last_commit_sha is written.
        sqlx::query(
            r#"
            UPDATE scans
            SET status = 'completed', finished_at = $1,
                biased_pages_count = $2, flagged_snippets_count = $3,
                last_commit_sha = COALESCE(working_commit_sha, last_commit_sha)
            WHERE id = $4
            "#,
        )
        .bind(Utc::now())
        .bind(biased_pages_count)
        .bind(flagged_snippets_count)
        .bind(scan_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            scan_id,
            biased_pages_count, flagged_snippets_count, "scan finalized"
        );

        // Snapshots merge on date, so a failure here is retried by the next
        // finalization and never blocks the scan itself.
        if let Err(err) = self.snapshots.calculate_and_save_today(pool).await {
            tracing::error!(scan_id, %err, "failed to refresh bias snapshots after finalization");
        }

        Ok(true)
    }
}
