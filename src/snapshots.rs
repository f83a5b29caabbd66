//! Daily bias snapshots
//!
//! For a given calendar date, the snapshot takes every distinct URL across
//! all completed scans started by end-of-day, picks the latest Page per
//! URL, and counts biased pages. Snapshots upsert on (date) and
//! (date, doc_set), so recomputation is idempotent and the scheduled
//! backfill can re-run any day safely.

use chrono::{NaiveDate, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::info;

use crate::bias::is_biased_value;
use crate::db::core::{BiasSnapshot, BiasSnapshotByDocset};
use crate::docset::extract_doc_set_from_url;
use crate::error::Result;

#[derive(Clone, Default)]
pub struct BiasSnapshotService;

/// Latest page state per URL as of a date: (url, doc_set, mcp_holistic).
type LatestPageRow = (String, Option<String>, Option<serde_json::Value>);

impl BiasSnapshotService {
    /// Latest Page per distinct URL across completed scans whose
    /// `started_at` falls on or before end-of-day of `date`.
    async fn latest_pages_as_of(
        &self,
        pool: &PgPool,
        date: NaiveDate,
    ) -> Result<Vec<LatestPageRow>> {
        let end_of_day = date
            .succ_opt()
            .unwrap_or(date)
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();

        let rows: Vec<LatestPageRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (p.url) p.url, p.doc_set, p.mcp_holistic
            FROM pages p
            JOIN scans s ON p.scan_id = s.id
            WHERE s.status = 'completed' AND s.started_at < $1
            ORDER BY p.url, s.started_at DESC, p.id DESC
            "#,
        )
        .bind(end_of_day)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Compute the overall snapshot for a date; None when no data exists.
    pub async fn calculate_snapshot_for_date(
        &self,
        pool: &PgPool,
        date: NaiveDate,
    ) -> Result<Option<BiasSnapshot>> {
        let pages = self.latest_pages_as_of(pool, date).await?;
        if pages.is_empty() {
            return Ok(None);
        }

        let total_pages = pages.len() as i64;
        let biased_pages = pages
            .iter()
            .filter(|(_, _, holistic)| {
                holistic.as_ref().map(is_biased_value).unwrap_or(false)
            })
            .count() as i64;
        let bias_percentage = percentage(biased_pages, total_pages);

        Ok(Some(BiasSnapshot {
            date,
            total_pages,
            biased_pages,
            bias_percentage,
            last_calculated_at: Utc::now(),
            additional_data: Some(json!({
                "calculation_method": "latest_per_url",
                "included_scan_statuses": ["completed"],
            })),
        }))
    }

    /// Compute per-docset snapshots for a date.
    pub async fn calculate_docset_snapshots_for_date(
        &self,
        pool: &PgPool,
        date: NaiveDate,
    ) -> Result<Vec<BiasSnapshotByDocset>> {
        let pages = self.latest_pages_as_of(pool, date).await?;
        if pages.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_docset: HashMap<String, (i64, i64)> = HashMap::new();
        for (url, doc_set, holistic) in &pages {
            let doc_set = doc_set
                .clone()
                .or_else(|| extract_doc_set_from_url(url));
            let Some(doc_set) = doc_set else { continue };

            let entry = by_docset.entry(doc_set).or_insert((0, 0));
            entry.0 += 1;
            if holistic.as_ref().map(is_biased_value).unwrap_or(false) {
                entry.1 += 1;
            }
        }

        let mut snapshots: Vec<BiasSnapshotByDocset> = by_docset
            .into_iter()
            .map(|(doc_set, (total, biased))| BiasSnapshotByDocset {
                date,
                doc_set,
                total_pages: total,
                biased_pages: biased,
                bias_percentage: percentage(biased, total),
            })
            .collect();
        snapshots.sort_by(|a, b| a.doc_set.cmp(&b.doc_set));
        Ok(snapshots)
    }

    pub async fn save_snapshot(&self, pool: &PgPool, snapshot: &BiasSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bias_snapshots (date, total_pages, biased_pages, bias_percentage,
                                        last_calculated_at, additional_data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (date) DO UPDATE
                SET total_pages = EXCLUDED.total_pages,
                    biased_pages = EXCLUDED.biased_pages,
                    bias_percentage = EXCLUDED.bias_percentage,
                    last_calculated_at = EXCLUDED.last_calculated_at,
                    additional_data = EXCLUDED.additional_data
            "#,
        )
        .bind(snapshot.date)
        .bind(snapshot.total_pages)
        .bind(snapshot.biased_pages)
        .bind(snapshot.bias_percentage)
        .bind(snapshot.last_calculated_at)
        .bind(&snapshot.additional_data)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn save_docset_snapshots(
        &self,
        pool: &PgPool,
        snapshots: &[BiasSnapshotByDocset],
    ) -> Result<()> {
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO bias_snapshots_by_docset (date, doc_set, total_pages, biased_pages,
                                                      bias_percentage)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (date, doc_set) DO UPDATE
                    SET total_pages = EXCLUDED.total_pages,
                        biased_pages = EXCLUDED.biased_pages,
                        bias_percentage = EXCLUDED.bias_percentage
                "#,
            )
            .bind(snapshot.date)
            .bind(&snapshot.doc_set)
            .bind(snapshot.total_pages)
            .bind(snapshot.biased_pages)
            .bind(snapshot.bias_percentage)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    /// Recompute and persist both snapshot flavours for a date.
    pub async fn calculate_and_save_for_date(
        &self,
        pool: &PgPool,
        date: NaiveDate,
    ) -> Result<Option<BiasSnapshot>> {
        let overall = self.calculate_snapshot_for_date(pool, date).await?;
        if let Some(ref snapshot) = overall {
            self.save_snapshot(pool, snapshot).await?;
            info!(
                %date,
                biased = snapshot.biased_pages,
                total = snapshot.total_pages,
                "bias snapshot refreshed"
            );
        }

        let docsets = self.calculate_docset_snapshots_for_date(pool, date).await?;
        if !docsets.is_empty() {
            self.save_docset_snapshots(pool, &docsets).await?;
        }

        Ok(overall)
    }

    /// Refresh today's snapshots; runs after every scan finalization.
    pub async fn calculate_and_save_today(&self, pool: &PgPool) -> Result<Option<BiasSnapshot>> {
        self.calculate_and_save_for_date(pool, Utc::now().date_naive())
            .await
    }

    /// Dates that have completed scans but no snapshot yet; the backfill
    /// job walks this list.
    pub async fn dates_needing_snapshots(&self, pool: &PgPool) -> Result<Vec<NaiveDate>> {
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT started_at::date FROM scans
            WHERE status = 'completed'
              AND started_at::date NOT IN (SELECT date FROM bias_snapshots)
            ORDER BY started_at::date
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    pub async fn get_snapshot_for_date(
        &self,
        pool: &PgPool,
        date: NaiveDate,
    ) -> Result<Option<BiasSnapshot>> {
        let snapshot =
            sqlx::query_as::<_, BiasSnapshot>("SELECT * FROM bias_snapshots WHERE date = $1")
                .bind(date)
                .fetch_optional(pool)
                .await?;
        Ok(snapshot)
    }

    pub async fn get_snapshots_range(
        &self,
        pool: &PgPool,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<BiasSnapshot>> {
        let snapshots = sqlx::query_as::<_, BiasSnapshot>(
            "SELECT * FROM bias_snapshots WHERE date >= $1 AND date <= $2 ORDER BY date",
        )
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;
        Ok(snapshots)
    }
}

fn percentage(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let pct = part as f64 / whole as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_rounds_to_two_places() {
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(2, 2), 100.0);
    }
}
