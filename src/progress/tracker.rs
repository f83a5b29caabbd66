//! Database-backed progress tracking
//!
//! Maintains the structured progress columns on the scan row:
//! `phase_progress`, `phase_timestamps`, `performance_metrics`,
//! `error_log` and the ETA. The tracker knows nothing about transport;
//! broadcasting lives in the progress service layered on top.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::Result;

/// Phases whose item totals grow the scan-level page total.
const DISCOVERY_PHASES: &[&str] = &["discovery", "discovering", "file_discovery", "crawling"];

#[derive(Clone, Default)]
pub struct ProgressTracker {
    // Phase start instants for rate estimation; in-memory because the rate
    // only matters to the process driving the phase.
    phase_started: Arc<Mutex<HashMap<(i64, String), DateTime<Utc>>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a phase and make it current.
    pub async fn start_phase(
        &self,
        pool: &PgPool,
        scan_id: i64,
        phase: &str,
        details: Option<Value>,
    ) -> Result<()> {
        info!(scan_id, phase, "starting phase");

        let row: Option<(Option<Value>, Option<Value>)> =
            sqlx::query_as("SELECT phase_progress, phase_timestamps FROM scans WHERE id = $1")
                .bind(scan_id)
                .fetch_optional(pool)
                .await?;
        let Some((progress, timestamps)) = row else {
            error!(scan_id, "scan not found");
            return Ok(());
        };

        let now = Utc::now();
        let mut progress = as_object(progress);
        let mut timestamps = as_object(timestamps);

        timestamps.insert(
            phase.to_string(),
            json!({ "started": now.to_rfc3339(), "finished": null }),
        );
        progress.insert(
            phase.to_string(),
            json!({
                "started": true,
                "completed": false,
                "progress_percentage": 0,
                "items_processed": 0,
                "items_total": 0,
                "current_item": null,
                "details": details.unwrap_or_else(|| json!({})),
            }),
        );

        sqlx::query(
            r#"
            UPDATE scans
            SET current_phase = $1, phase_progress = $2, phase_timestamps = $3
            WHERE id = $4
            "#,
        )
        .bind(phase)
        .bind(Value::Object(progress))
        .bind(Value::Object(timestamps))
        .bind(scan_id)
        .execute(pool)
        .await?;

        self.phase_started
            .lock()
            .await
            .insert((scan_id, phase.to_string()), now);

        Ok(())
    }

    /// Update progress within the current phase and refresh the ETA.
    pub async fn update_phase_progress(
        &self,
        pool: &PgPool,
        scan_id: i64,
        items_processed: i64,
        items_total: Option<i64>,
        current_item: Option<&str>,
        details: Option<Value>,
    ) -> Result<()> {
        let row: Option<(Option<String>, Option<Value>, i64, Option<Value>)> = sqlx::query_as(
            r#"
            SELECT current_phase, phase_progress, total_pages_found, performance_metrics
            FROM scans WHERE id = $1
            "#,
        )
        .bind(scan_id)
        .fetch_optional(pool)
        .await?;

        let Some((Some(phase), progress, total_pages_found, metrics)) = row else {
            return Ok(());
        };

        let mut progress = as_object(progress);
        let entry = progress
            .entry(phase.clone())
            .or_insert_with(|| json!({}));
        let Some(entry) = entry.as_object_mut() else {
            return Ok(());
        };

        entry.insert("items_processed".into(), json!(items_processed));

        let mut new_total_pages = total_pages_found;
        if let Some(total) = items_total {
            entry.insert("items_total".into(), json!(total));

            // Discovery keeps raising the observed total; other phases only
            // grow it, never shrink it.
            if total_pages_found == 0
                || total > total_pages_found
                || DISCOVERY_PHASES.contains(&phase.as_str())
            {
                new_total_pages = total;
            }
        }

        let total_in_phase = entry
            .get("items_total")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if total_in_phase > 0 {
            let pct = (items_processed as f64 / total_in_phase as f64) * 100.0;
            entry.insert("progress_percentage".into(), json!(pct));
        }

        if let Some(item) = current_item {
            entry.insert("current_item".into(), json!(item));
        }
        if let Some(details) = details {
            merge_details(entry, details);
        }

        // Rate-based ETA from the in-memory phase start instant.
        let mut estimated_completion: Option<DateTime<Utc>> = None;
        let mut metrics = as_object(metrics);
        if let Some(total) = items_total.filter(|t| *t > 0) {
            if items_processed > 0 {
                let started = self
                    .phase_started
                    .lock()
                    .await
                    .get(&(scan_id, phase.clone()))
                    .copied();
                if let Some(started) = started {
                    let elapsed = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
                    if elapsed > 0.0 {
                        let rate = items_processed as f64 / elapsed;
                        let remaining = (total - items_processed).max(0) as f64;
                        estimated_completion = Some(
                            Utc::now()
                                + chrono::Duration::milliseconds((remaining / rate * 1000.0) as i64),
                        );
                        metrics.insert(
                            phase.clone(),
                            json!({
                                "processing_rate": rate,
                                "elapsed_seconds": elapsed,
                                "items_per_second": rate,
                            }),
                        );
                    }
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE scans
            SET phase_progress = $1, pages_processed = $2, total_pages_found = $3,
                current_page_url = COALESCE($4, current_page_url),
                estimated_completion = COALESCE($5, estimated_completion),
                performance_metrics = $6
            WHERE id = $7
            "#,
        )
        .bind(Value::Object(progress))
        .bind(items_processed)
        .bind(new_total_pages)
        .bind(current_item)
        .bind(estimated_completion)
        .bind(Value::Object(metrics))
        .bind(scan_id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Mark a phase finished at 100%.
    pub async fn complete_phase(
        &self,
        pool: &PgPool,
        scan_id: i64,
        phase: &str,
        summary: Option<Value>,
    ) -> Result<()> {
        info!(scan_id, phase, "completing phase");

        let row: Option<(Option<Value>, Option<Value>)> =
            sqlx::query_as("SELECT phase_progress, phase_timestamps FROM scans WHERE id = $1")
                .bind(scan_id)
                .fetch_optional(pool)
                .await?;
        let Some((progress, timestamps)) = row else {
            return Ok(());
        };

        let mut progress = as_object(progress);
        let mut timestamps = as_object(timestamps);

        if let Some(ts) = timestamps.get_mut(phase).and_then(Value::as_object_mut) {
            ts.insert("finished".into(), json!(Utc::now().to_rfc3339()));
        }
        if let Some(entry) = progress.get_mut(phase).and_then(Value::as_object_mut) {
            entry.insert("completed".into(), json!(true));
            entry.insert("progress_percentage".into(), json!(100));
            if let Some(summary) = summary {
                entry.insert("summary".into(), summary);
            }
        }

        sqlx::query("UPDATE scans SET phase_progress = $1, phase_timestamps = $2 WHERE id = $3")
            .bind(Value::Object(progress))
            .bind(Value::Object(timestamps))
            .bind(scan_id)
            .execute(pool)
            .await?;

        self.phase_started
            .lock()
            .await
            .remove(&(scan_id, phase.to_string()));

        Ok(())
    }

    /// Append to the scan's error log.
    pub async fn report_error(
        &self,
        pool: &PgPool,
        scan_id: i64,
        message: &str,
        details: Option<Value>,
    ) -> Result<()> {
        error!(scan_id, message, "scan error");

        let row: Option<(Option<Value>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT error_log, current_phase, current_page_url FROM scans WHERE id = $1",
        )
        .bind(scan_id)
        .fetch_optional(pool)
        .await?;
        let Some((log, phase, current_item)) = row else {
            return Ok(());
        };

        let mut entries = log.and_then(|v| v.as_array().cloned()).unwrap_or_default();
        entries.push(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "message": message,
            "phase": phase,
            "current_item": current_item,
            "details": details.unwrap_or_else(|| json!({})),
        }));

        sqlx::query("UPDATE scans SET error_log = $1 WHERE id = $2")
            .bind(Value::Array(entries))
            .bind(scan_id)
            .execute(pool)
            .await?;

        Ok(())
    }
}

fn as_object(value: Option<Value>) -> Map<String, Value> {
    value
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

fn merge_details(entry: &mut Map<String, Value>, details: Value) {
    let existing = entry
        .entry("details".to_string())
        .or_insert_with(|| json!({}));
    if let (Some(existing), Some(new)) = (existing.as_object_mut(), details.as_object()) {
        for (key, value) in new {
            existing.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_details_overlays_keys() {
        let mut entry = Map::new();
        entry.insert("details".into(), json!({"a": 1, "b": 2}));
        merge_details(&mut entry, json!({"b": 3, "c": 4}));
        assert_eq!(entry["details"], json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn as_object_handles_null_and_non_objects() {
        assert!(as_object(None).is_empty());
        assert!(as_object(Some(json!(null))).is_empty());
        assert!(as_object(Some(json!([1, 2]))).is_empty());
        assert_eq!(as_object(Some(json!({"k": 1})))["k"], json!(1));
    }
}
