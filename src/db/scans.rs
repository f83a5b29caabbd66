//! Scan row queries

use chrono::Utc;
use sqlx::PgPool;

use crate::db::core::{PageStatus, Scan, ScanStatus};
use crate::error::Result;

/// Create a new scan in `in_progress`. The web layer normally does this;
/// workers use it in tests and recovery tooling.
pub async fn create_scan(pool: &PgPool, url: &str) -> Result<Scan> {
    let scan = sqlx::query_as::<_, Scan>(
        "INSERT INTO scans (url, started_at, status) VALUES ($1, $2, 'in_progress') RETURNING *",
    )
    .bind(url)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(scan)
}

pub async fn get_scan(pool: &PgPool, scan_id: i64) -> Result<Option<Scan>> {
    let scan = sqlx::query_as::<_, Scan>("SELECT * FROM scans WHERE id = $1")
        .bind(scan_id)
        .fetch_optional(pool)
        .await?;
    Ok(scan)
}

/// The authoritative cancellation signal every worker checks before and
/// after I/O boundaries.
pub async fn is_cancellation_requested(pool: &PgPool, scan_id: i64) -> Result<bool> {
    let row: Option<(bool,)> =
        sqlx::query_as("SELECT cancellation_requested FROM scans WHERE id = $1")
            .bind(scan_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(c,)| c).unwrap_or(false))
}

pub async fn set_status(pool: &PgPool, scan_id: i64, status: ScanStatus) -> Result<()> {
    sqlx::query("UPDATE scans SET status = $1 WHERE id = $2")
        .bind(status.as_str())
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Discovery is the only caller: records the HEAD observed at discovery
/// start and the baseline strategy in use. `last_commit_sha` is untouched;
/// only finalization promotes the working commit.
pub async fn set_working_commit(
    pool: &PgPool,
    scan_id: i64,
    commit_sha: &str,
    baseline_type: &str,
) -> Result<()> {
    sqlx::query("UPDATE scans SET working_commit_sha = $1, baseline_type = $2 WHERE id = $3")
        .bind(commit_sha)
        .bind(baseline_type)
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_file_counters(
    pool: &PgPool,
    scan_id: i64,
    discovered: i64,
    queued: i64,
    completed: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE scans
        SET total_files_discovered = $1, total_files_queued = $2, total_files_completed = $3
        WHERE id = $4
        "#,
    )
    .bind(discovered)
    .bind(queued)
    .bind(completed)
    .bind(scan_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recompute `total_files_completed` from page statuses. Recomputing rather
/// than incrementing keeps the counter drift-free under message replays.
pub async fn refresh_files_completed(pool: &PgPool, scan_id: i64) -> Result<i64> {
    let statuses: Vec<&str> = [
        PageStatus::Processed,
        PageStatus::Error,
        PageStatus::Removed,
        PageStatus::SkippedLocked,
        PageStatus::SkippedNoChange,
    ]
    .iter()
    .map(|s| s.as_str())
    .collect();

    let (completed,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM pages WHERE scan_id = $1 AND status = ANY($2)",
    )
    .bind(scan_id)
    .bind(&statuses)
    .fetch_one(pool)
    .await?;

    sqlx::query("UPDATE scans SET total_files_completed = $1 WHERE id = $2")
        .bind(completed)
        .bind(scan_id)
        .execute(pool)
        .await?;

    Ok(completed)
}

/// Terminal error state. Finalization never runs on an errored scan.
pub async fn mark_error(pool: &PgPool, scan_id: i64) -> Result<()> {
    sqlx::query("UPDATE scans SET status = 'error', finished_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Move a cancellation-requested scan to its terminal state. A cancelled
/// scan never becomes `completed`, so the guard excludes terminal statuses.
pub async fn mark_cancelled(pool: &PgPool, scan_id: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE scans SET status = 'cancelled', finished_at = $1
        WHERE id = $2 AND status NOT IN ('completed', 'error', 'cancelled')
        "#,
    )
    .bind(Utc::now())
    .bind(scan_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Close a scan that discovered nothing to do.
pub async fn complete_with_no_changes(pool: &PgPool, scan_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE scans
        SET status = 'completed', finished_at = $1,
            total_files_discovered = 0, total_files_queued = 0, total_files_completed = 0
        WHERE id = $2
        "#,
    )
    .bind(Utc::now())
    .bind(scan_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent completed scan with a usable commit baseline for a repo.
pub async fn last_complete_scan(pool: &PgPool, repo_url: &str) -> Result<Option<Scan>> {
    let scan = sqlx::query_as::<_, Scan>(
        r#"
        SELECT * FROM scans
        WHERE url = $1 AND status = 'completed' AND last_commit_sha IS NOT NULL
        ORDER BY finished_at DESC NULLS LAST
        LIMIT 1
        "#,
    )
    .bind(repo_url)
    .fetch_optional(pool)
    .await?;
    Ok(scan)
}
