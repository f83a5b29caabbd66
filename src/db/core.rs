//! Core database setup and row models
//!
//! PostgreSQL storage for scans, pages, snippets, processing locks,
//! processing history and bias snapshots. Uses sqlx for async access; the
//! schema is created on startup so workers can run against a fresh database.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use std::time::Duration;

use crate::error::Result;
use crate::queue::create_queue_tables;

// ============================================================================
// Pool
// ============================================================================

/// Connect to Postgres and make sure the schema exists.
pub async fn init_db(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    create_core_tables(&pool).await?;
    create_queue_tables(&pool).await?;

    Ok(pool)
}

/// Idempotent schema creation for the core tables.
pub async fn create_core_tables(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scans (
            id BIGSERIAL PRIMARY KEY,
            url TEXT,
            started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            finished_at TIMESTAMPTZ,
            status TEXT NOT NULL DEFAULT 'in_progress',
            biased_pages_count BIGINT NOT NULL DEFAULT 0,
            flagged_snippets_count BIGINT NOT NULL DEFAULT 0,
            current_phase TEXT,
            current_page_url TEXT,
            total_pages_found BIGINT NOT NULL DEFAULT 0,
            pages_processed BIGINT NOT NULL DEFAULT 0,
            snippets_processed BIGINT NOT NULL DEFAULT 0,
            phase_progress JSONB,
            error_log JSONB,
            phase_timestamps JSONB,
            estimated_completion TIMESTAMPTZ,
            performance_metrics JSONB,
            cancellation_requested BOOLEAN NOT NULL DEFAULT FALSE,
            cancellation_requested_at TIMESTAMPTZ,
            cancellation_reason TEXT,
            working_commit_sha VARCHAR(40),
            last_commit_sha VARCHAR(40),
            baseline_type VARCHAR(20),
            total_files_discovered BIGINT NOT NULL DEFAULT 0,
            total_files_queued BIGINT NOT NULL DEFAULT 0,
            total_files_completed BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id BIGSERIAL PRIMARY KEY,
            scan_id BIGINT NOT NULL REFERENCES scans(id),
            url TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'discovered',
            processing_state TEXT DEFAULT 'discovered',
            mcp_holistic JSONB,
            doc_set VARCHAR(255),
            content_hash TEXT,
            github_sha TEXT,
            last_modified TIMESTAMPTZ,
            last_scanned_at TIMESTAMPTZ,
            processing_started_at TIMESTAMPTZ,
            processing_worker_id TEXT,
            processing_expires_at TIMESTAMPTZ,
            retry_count INT NOT NULL DEFAULT 0,
            last_error_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_scan_url ON pages(scan_id, url)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_url ON pages(url)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snippets (
            id BIGSERIAL PRIMARY KEY,
            page_id BIGINT NOT NULL REFERENCES pages(id),
            context TEXT NOT NULL DEFAULT '',
            code TEXT NOT NULL,
            llm_score JSONB
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_urls (
            id BIGSERIAL PRIMARY KEY,
            url TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            scan_id BIGINT NOT NULL REFERENCES scans(id),
            worker_id TEXT,
            started_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL DEFAULT 'processing'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one live lock per (url, content_hash); historical rows are kept.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_processing_urls_active
            ON processing_urls(url, content_hash) WHERE status = 'processing'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_processing_history (
            id BIGSERIAL PRIMARY KEY,
            file_path VARCHAR(500) NOT NULL,
            github_sha VARCHAR(40) NOT NULL,
            scan_id BIGINT NOT NULL REFERENCES scans(id),
            processed_at TIMESTAMPTZ NOT NULL,
            processing_result VARCHAR(20) NOT NULL,
            processing_duration_ms BIGINT,
            error_message TEXT,
            snippets_found BIGINT DEFAULT 0,
            bias_detected BOOLEAN DEFAULT FALSE,
            worker_id VARCHAR(100),
            commit_sha VARCHAR(40),
            CONSTRAINT uq_file_processing_history UNIQUE (file_path, github_sha, scan_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bias_snapshots (
            date DATE PRIMARY KEY,
            total_pages BIGINT NOT NULL,
            biased_pages BIGINT NOT NULL,
            bias_percentage DOUBLE PRECISION NOT NULL,
            last_calculated_at TIMESTAMPTZ NOT NULL,
            additional_data JSONB
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bias_snapshots_by_docset (
            date DATE NOT NULL,
            doc_set TEXT NOT NULL,
            total_pages BIGINT NOT NULL,
            biased_pages BIGINT NOT NULL,
            bias_percentage DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (date, doc_set)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Status alphabets
// ============================================================================

/// Scan lifecycle: in_progress -> processing -> completed | error | cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    InProgress,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::InProgress => "in_progress",
            ScanStatus::Processing => "processing",
            ScanStatus::Completed => "completed",
            ScanStatus::Error => "error",
            ScanStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(ScanStatus::InProgress),
            "processing" => Some(ScanStatus::Processing),
            "completed" => Some(ScanStatus::Completed),
            "error" => Some(ScanStatus::Error),
            "cancelled" => Some(ScanStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Error | ScanStatus::Cancelled
        )
    }
}

/// Page processing states. `processing_state` mirrors `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageStatus {
    Discovered,
    Queued,
    Processing,
    Processed,
    Error,
    Removed,
    SkippedLocked,
    SkippedNoChange,
    QueueFailed,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Discovered => "discovered",
            PageStatus::Queued => "queued",
            PageStatus::Processing => "processing",
            PageStatus::Processed => "processed",
            PageStatus::Error => "error",
            PageStatus::Removed => "removed",
            PageStatus::SkippedLocked => "skipped_locked",
            PageStatus::SkippedNoChange => "skipped_no_change",
            PageStatus::QueueFailed => "queue_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(PageStatus::Discovered),
            "queued" => Some(PageStatus::Queued),
            "processing" => Some(PageStatus::Processing),
            "processed" => Some(PageStatus::Processed),
            "error" => Some(PageStatus::Error),
            "removed" => Some(PageStatus::Removed),
            "skipped_locked" => Some(PageStatus::SkippedLocked),
            "skipped_no_change" => Some(PageStatus::SkippedNoChange),
            "queue_failed" => Some(PageStatus::QueueFailed),
            _ => None,
        }
    }

    /// Statuses counted towards `total_files_completed`: the file needs no
    /// further work from the document pipeline.
    pub fn is_file_terminal(&self) -> bool {
        matches!(
            self,
            PageStatus::Processed
                | PageStatus::Error
                | PageStatus::Removed
                | PageStatus::SkippedLocked
                | PageStatus::SkippedNoChange
        )
    }
}

// ============================================================================
// Row models
// ============================================================================

/// One discovery + processing pass over a repository.
#[derive(Debug, Clone, FromRow)]
pub struct Scan {
    pub id: i64,
    pub url: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub biased_pages_count: i64,
    pub flagged_snippets_count: i64,
    pub current_phase: Option<String>,
    pub current_page_url: Option<String>,
    pub total_pages_found: i64,
    pub pages_processed: i64,
    pub snippets_processed: i64,
    pub phase_progress: Option<serde_json::Value>,
    pub error_log: Option<serde_json::Value>,
    pub phase_timestamps: Option<serde_json::Value>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub performance_metrics: Option<serde_json::Value>,
    pub cancellation_requested: bool,
    pub cancellation_requested_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub working_commit_sha: Option<String>,
    pub last_commit_sha: Option<String>,
    pub baseline_type: Option<String>,
    pub total_files_discovered: i64,
    pub total_files_queued: i64,
    pub total_files_completed: i64,
}

impl Scan {
    pub fn status(&self) -> Option<ScanStatus> {
        ScanStatus::parse(&self.status)
    }
}

/// One (scan, URL) tuple.
#[derive(Debug, Clone, FromRow)]
pub struct Page {
    pub id: i64,
    pub scan_id: i64,
    pub url: String,
    pub status: String,
    pub processing_state: Option<String>,
    pub mcp_holistic: Option<serde_json::Value>,
    pub doc_set: Option<String>,
    pub content_hash: Option<String>,
    pub github_sha: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_worker_id: Option<String>,
    pub processing_expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Page {
    pub fn status(&self) -> Option<PageStatus> {
        PageStatus::parse(&self.status)
    }
}

/// Code snippet extracted from a page.
#[derive(Debug, Clone, FromRow)]
pub struct Snippet {
    pub id: i64,
    pub page_id: i64,
    pub context: String,
    pub code: String,
    pub llm_score: Option<serde_json::Value>,
}

/// Cross-scan processing lock row. Never deleted; terminal rows form the
/// audit trail consulted by the lock service.
#[derive(Debug, Clone, FromRow)]
pub struct ProcessingUrl {
    pub id: i64,
    pub url: String,
    pub content_hash: String,
    pub scan_id: i64,
    pub worker_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: String,
}

/// Append-only audit log of per-file processing attempts.
#[derive(Debug, Clone, FromRow)]
pub struct FileProcessingHistory {
    pub id: i64,
    pub file_path: String,
    pub github_sha: String,
    pub scan_id: i64,
    pub processed_at: DateTime<Utc>,
    pub processing_result: String,
    pub processing_duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub snippets_found: Option<i64>,
    pub bias_detected: Option<bool>,
    pub worker_id: Option<String>,
    pub commit_sha: Option<String>,
}

/// Immutable per-date rollup across all completed scans.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BiasSnapshot {
    pub date: NaiveDate,
    pub total_pages: i64,
    pub biased_pages: i64,
    pub bias_percentage: f64,
    pub last_calculated_at: DateTime<Utc>,
    pub additional_data: Option<serde_json::Value>,
}

/// Per-date, per-docset rollup.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BiasSnapshotByDocset {
    pub date: NaiveDate,
    pub doc_set: String,
    pub total_pages: i64,
    pub biased_pages: i64,
    pub bias_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_status_round_trip() {
        for status in [
            ScanStatus::InProgress,
            ScanStatus::Processing,
            ScanStatus::Completed,
            ScanStatus::Error,
            ScanStatus::Cancelled,
        ] {
            assert_eq!(ScanStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ScanStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_scan_statuses() {
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Cancelled.is_terminal());
        assert!(!ScanStatus::Processing.is_terminal());
    }

    #[test]
    fn file_terminal_page_statuses() {
        assert!(PageStatus::Processed.is_file_terminal());
        assert!(PageStatus::SkippedLocked.is_file_terminal());
        assert!(PageStatus::SkippedNoChange.is_file_terminal());
        assert!(PageStatus::Removed.is_file_terminal());
        assert!(PageStatus::Error.is_file_terminal());
        assert!(!PageStatus::Queued.is_file_terminal());
        assert!(!PageStatus::Processing.is_file_terminal());
        assert!(!PageStatus::QueueFailed.is_file_terminal());
    }
}
