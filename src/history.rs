//! File processing history
//!
//! Append-only audit log of per-file processing attempts, keyed by
//! (file_path, github_sha, scan_id). Besides auditability, the history is
//! how interrupted scans recover: the latest successfully processed
//! (file_path -> github_sha) map reconstructs a partial baseline when no
//! complete scan is recent enough.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::db::core::FileProcessingHistory;
use crate::error::Result;

/// Result alphabet stored in `processing_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    Processing,
    Processed,
    Queued,
    Skipped,
    Failed,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Processed => "processed",
            ProcessingResult::Queued => "queued",
            ProcessingResult::Skipped => "skipped",
            ProcessingResult::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingHistoryService;

impl ProcessingHistoryService {
    /// Upsert a `processing` row at the start of a file's processing.
    pub async fn record_start(
        &self,
        pool: &PgPool,
        file_path: &str,
        github_sha: &str,
        scan_id: i64,
        worker_id: &str,
        commit_sha: Option<&str>,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO file_processing_history
                (file_path, github_sha, scan_id, processed_at, processing_result, worker_id, commit_sha)
            VALUES ($1, $2, $3, $4, 'processing', $5, $6)
            ON CONFLICT ON CONSTRAINT uq_file_processing_history DO UPDATE
                SET processed_at = EXCLUDED.processed_at,
                    processing_result = 'processing',
                    worker_id = EXCLUDED.worker_id,
                    commit_sha = EXCLUDED.commit_sha
            RETURNING id
            "#,
        )
        .bind(file_path)
        .bind(github_sha)
        .bind(scan_id)
        .bind(Utc::now())
        .bind(worker_id)
        .bind(commit_sha)
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    /// Record how a file's processing attempt ended.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_completion(
        &self,
        pool: &PgPool,
        file_path: &str,
        github_sha: &str,
        scan_id: i64,
        result: ProcessingResult,
        duration_ms: i64,
        snippets_found: i64,
        bias_detected: bool,
        error_message: Option<&str>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE file_processing_history
            SET processing_result = $1, processing_duration_ms = $2, snippets_found = $3,
                bias_detected = $4, error_message = $5, processed_at = $6
            WHERE file_path = $7 AND github_sha = $8 AND scan_id = $9
            "#,
        )
        .bind(result.as_str())
        .bind(duration_ms)
        .bind(snippets_found)
        .bind(bias_detected)
        .bind(error_message)
        .bind(Utc::now())
        .bind(file_path)
        .bind(github_sha)
        .bind(scan_id)
        .execute(pool)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::warn!(file_path, scan_id, "no processing history row to complete");
        }
        Ok(())
    }

    /// Latest successfully processed (file_path -> github_sha) map for a
    /// repository, restricted to recent scans. This is the partial-baseline
    /// source.
    pub async fn processed_files_map(
        &self,
        pool: &PgPool,
        repo_url: &str,
        max_age_days: i64,
    ) -> Result<HashMap<String, String>> {
        let cutoff = Utc::now() - Duration::days(max_age_days);

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (h.file_path) h.file_path, h.github_sha
            FROM file_processing_history h
            JOIN scans s ON h.scan_id = s.id
            WHERE s.url = $1 AND h.processing_result = 'processed' AND h.processed_at >= $2
            ORDER BY h.file_path, h.processed_at DESC
            "#,
        )
        .bind(repo_url)
        .bind(cutoff)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Per-result counts for a scan.
    pub async fn scan_summary(&self, pool: &PgPool, scan_id: i64) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT processing_result, COUNT(*) FROM file_processing_history
            WHERE scan_id = $1 GROUP BY processing_result
            "#,
        )
        .bind(scan_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Files that failed in a scan, newest first.
    pub async fn failed_files(
        &self,
        pool: &PgPool,
        scan_id: i64,
    ) -> Result<Vec<FileProcessingHistory>> {
        let rows = sqlx::query_as::<_, FileProcessingHistory>(
            r#"
            SELECT * FROM file_processing_history
            WHERE scan_id = $1 AND processing_result = 'failed'
            ORDER BY processed_at DESC
            "#,
        )
        .bind(scan_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Drop history older than the retention window.
    pub async fn cleanup_old_history(&self, pool: &PgPool, days_to_keep: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days_to_keep);
        let result = sqlx::query("DELETE FROM file_processing_history WHERE processed_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up old processing history");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_alphabet() {
        assert_eq!(ProcessingResult::Processed.as_str(), "processed");
        assert_eq!(ProcessingResult::Queued.as_str(), "queued");
        assert_eq!(ProcessingResult::Skipped.as_str(), "skipped");
        assert_eq!(ProcessingResult::Failed.as_str(), "failed");
    }
}
