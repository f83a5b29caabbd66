//! URL lock service
//!
//! Global at-most-one lock keyed by (url, content_hash), shared by every
//! scan in the system. A partial unique index over rows with
//! status = 'processing' makes the insert the linearization point: two
//! workers racing for the same URL+hash resolve at the database, and the
//! loser sees a unique-constraint violation. Lock rows are never deleted;
//! completed and failed rows double as the processing audit trail.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::core::ProcessingUrl;
use crate::error::{Error, Result};

/// Outcome of an acquire attempt. Refusals are expected control flow and
/// carry the reason shown in scan logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Another scan (or this one) holds an active lock.
    HeldByScan(i64),
    /// The exact content was already processed successfully.
    ContentUnchanged,
    /// A Page with the same content was recently processed in some scan.
    RecentlyProcessed,
    /// Insert raced another worker and lost.
    LostRace,
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }

    pub fn reason(&self) -> String {
        match self {
            LockOutcome::Acquired => "acquired".to_string(),
            LockOutcome::HeldByScan(scan_id) => {
                format!("already processing in scan {scan_id}")
            }
            LockOutcome::ContentUnchanged => "content unchanged since last processing".to_string(),
            LockOutcome::RecentlyProcessed => "content recently processed".to_string(),
            LockOutcome::LostRace => "lock already exists (race condition)".to_string(),
        }
    }
}

/// Per-process lock service. The worker id identifies this process in lock
/// rows and page lock mirrors.
#[derive(Debug, Clone)]
pub struct UrlLockService {
    pub worker_id: String,
    lock_timeout_minutes: i64,
}

impl UrlLockService {
    pub fn new(lock_timeout_minutes: i64) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        Self {
            worker_id: format!("{host}-{suffix}"),
            lock_timeout_minutes,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::minutes(self.lock_timeout_minutes)
    }

    /// Try to take the processing lock for (url, content_hash).
    pub async fn acquire(
        &self,
        pool: &PgPool,
        url: &str,
        content_hash: &str,
        scan_id: i64,
    ) -> Result<LockOutcome> {
        self.sweep_expired(pool).await?;

        // Active lock anywhere, including this same scan, refuses.
        let existing: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT scan_id FROM processing_urls
            WHERE url = $1 AND content_hash = $2 AND status = 'processing'
            "#,
        )
        .bind(url)
        .bind(content_hash)
        .fetch_optional(pool)
        .await?;

        if let Some((holder,)) = existing {
            tracing::debug!(%url, holder_scan = holder, "lock refused, already held");
            return Ok(LockOutcome::HeldByScan(holder));
        }

        if !self.should_reprocess(pool, url, content_hash).await? {
            return Ok(LockOutcome::ContentUnchanged);
        }

        if self.recently_processed(pool, url, content_hash).await? {
            return Ok(LockOutcome::RecentlyProcessed);
        }

        let now = Utc::now();
        let insert = sqlx::query(
            r#"
            INSERT INTO processing_urls (url, content_hash, scan_id, worker_id, started_at, expires_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'processing')
            "#,
        )
        .bind(url)
        .bind(content_hash)
        .bind(scan_id)
        .bind(&self.worker_id)
        .bind(now)
        .bind(now + self.lock_timeout())
        .execute(pool)
        .await;

        match insert {
            Ok(_) => {
                tracing::debug!(%url, scan_id, worker = %self.worker_id, "acquired processing lock");
                Ok(LockOutcome::Acquired)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tracing::debug!(%url, "lost lock race");
                Ok(LockOutcome::LostRace)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Release the lock this scan holds, marking the row completed or failed.
    pub async fn release(
        &self,
        pool: &PgPool,
        url: &str,
        content_hash: &str,
        scan_id: i64,
        success: bool,
    ) -> Result<bool> {
        let status = if success { "completed" } else { "failed" };
        let result = sqlx::query(
            r#"
            UPDATE processing_urls SET status = $1
            WHERE url = $2 AND content_hash = $3 AND scan_id = $4 AND status = 'processing'
            "#,
        )
        .bind(status)
        .bind(url)
        .bind(content_hash)
        .bind(scan_id)
        .execute(pool)
        .await?;

        let released = result.rows_affected() > 0;
        if !released {
            tracing::warn!(%url, scan_id, "no active lock found to release");
        }
        Ok(released)
    }

    /// Whether (url, content_hash) is currently locked, and by which scan.
    pub async fn is_locked(
        &self,
        pool: &PgPool,
        url: &str,
        content_hash: &str,
    ) -> Result<Option<i64>> {
        self.sweep_expired(pool).await?;

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT scan_id FROM processing_urls
            WHERE url = $1 AND content_hash = $2 AND status = 'processing'
            "#,
        )
        .bind(url)
        .bind(content_hash)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|(scan_id,)| scan_id))
    }

    /// A crashed worker's lock expires after the TTL; the sweep turns it into
    /// an `expired` audit row so the URL can be claimed again.
    async fn sweep_expired(&self, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE processing_urls SET status = 'expired' WHERE status = 'processing' AND expires_at < $1",
        )
        .bind(Utc::now())
        .execute(pool)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            tracing::warn!(count = swept, "expired stale processing locks");
        }
        Ok(swept)
    }

    async fn should_reprocess(&self, pool: &PgPool, url: &str, content_hash: &str) -> Result<bool> {
        let completed: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM processing_urls
            WHERE url = $1 AND content_hash = $2 AND status = 'completed'
            LIMIT 1
            "#,
        )
        .bind(url)
        .bind(content_hash)
        .fetch_optional(pool)
        .await?;
        Ok(completed.is_none())
    }

    async fn recently_processed(&self, pool: &PgPool, url: &str, content_hash: &str) -> Result<bool> {
        let processed: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM pages
            WHERE url = $1 AND content_hash = $2 AND status = 'processed'
            ORDER BY last_scanned_at DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(url)
        .bind(content_hash)
        .fetch_optional(pool)
        .await?;
        Ok(processed.is_some())
    }

    /// Per-status lock counts for operational dashboards.
    pub async fn stats(&self, pool: &PgPool) -> Result<LockStats> {
        self.sweep_expired(pool).await?;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM processing_urls GROUP BY status")
                .fetch_all(pool)
                .await?;

        let mut by_status = HashMap::new();
        for (status, count) in rows {
            by_status.insert(status, count);
        }

        Ok(LockStats {
            active: *by_status.get("processing").unwrap_or(&0),
            completed: *by_status.get("completed").unwrap_or(&0),
            failed: *by_status.get("failed").unwrap_or(&0),
            expired: *by_status.get("expired").unwrap_or(&0),
            worker_id: self.worker_id.clone(),
        })
    }

    /// Fetch the lock row for diagnostics; errors if it does not exist.
    pub async fn get_lock(
        &self,
        pool: &PgPool,
        url: &str,
        content_hash: &str,
    ) -> Result<ProcessingUrl> {
        sqlx::query_as::<_, ProcessingUrl>(
            r#"
            SELECT * FROM processing_urls
            WHERE url = $1 AND content_hash = $2
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(url)
        .bind(content_hash)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no lock row for {url}")))
    }
}

#[derive(Debug, Clone)]
pub struct LockStats {
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub expired: i64,
    pub worker_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_shape() {
        let service = UrlLockService::new(30);
        let (host, suffix) = service.worker_id.rsplit_once('-').unwrap();
        assert!(!host.is_empty());
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn refusal_reasons() {
        assert!(LockOutcome::Acquired.is_acquired());
        assert!(!LockOutcome::LostRace.is_acquired());
        assert_eq!(
            LockOutcome::HeldByScan(7).reason(),
            "already processing in scan 7"
        );
        assert_eq!(
            LockOutcome::ContentUnchanged.reason(),
            "content unchanged since last processing"
        );
    }

    #[test]
    fn lock_timeout_from_minutes() {
        let service = UrlLockService::new(30);
        assert_eq!(service.lock_timeout(), Duration::minutes(30));
    }
}
