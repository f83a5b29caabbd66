//! Progress tracking and broadcasting
//!
//! `ProgressTracker` owns the durable progress state on the scan row;
//! `ProgressBroadcaster` fans events out to live subscribers; and
//! `ProgressService` glues the two so every durable mutation is followed by
//! a matching broadcast in commit order.

pub mod broadcast;
pub mod tracker;

pub use broadcast::{ProgressBroadcaster, ProgressEvent};
pub use tracker::ProgressTracker;

use serde_json::Value;
use sqlx::PgPool;

use crate::db::scans;
use crate::error::Result;

#[derive(Clone, Default)]
pub struct ProgressService {
    tracker: ProgressTracker,
    broadcaster: ProgressBroadcaster,
}

impl ProgressService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.broadcaster
    }

    /// Subscribe a new listener, returning the stream plus the current
    /// snapshot to send first.
    pub async fn subscribe(
        &self,
        pool: &PgPool,
        scan_id: i64,
    ) -> Result<(
        tokio::sync::broadcast::Receiver<ProgressEvent>,
        Option<ProgressEvent>,
    )> {
        let receiver = self.broadcaster.subscribe(scan_id).await;
        let initial = self.initial_progress(pool, scan_id).await?;
        Ok((receiver, initial))
    }

    async fn initial_progress(&self, pool: &PgPool, scan_id: i64) -> Result<Option<ProgressEvent>> {
        let Some(scan) = scans::get_scan(pool, scan_id).await? else {
            return Ok(None);
        };
        Ok(Some(ProgressEvent::InitialProgress {
            scan_id,
            status: scan.status.clone(),
            current_phase: scan.current_phase.clone(),
            overall_progress: overall_progress(
                scan.pages_processed,
                scan.total_pages_found,
                &scan.status,
            ),
            total_pages_found: scan.total_pages_found,
            pages_processed: scan.pages_processed,
            current_page_url: scan.current_page_url,
        }))
    }

    pub async fn start_phase(
        &self,
        pool: &PgPool,
        scan_id: i64,
        phase: &str,
        details: Option<Value>,
    ) -> Result<()> {
        self.tracker
            .start_phase(pool, scan_id, phase, details.clone())
            .await?;

        let scan_status = scans::get_scan(pool, scan_id).await?.map(|s| s.status);
        self.broadcaster
            .publish(
                scan_id,
                ProgressEvent::PhaseStart {
                    scan_id,
                    phase: phase.to_string(),
                    details,
                    scan_status,
                },
            )
            .await;
        Ok(())
    }

    pub async fn update_phase_progress(
        &self,
        pool: &PgPool,
        scan_id: i64,
        items_processed: i64,
        items_total: Option<i64>,
        current_item: Option<&str>,
        details: Option<Value>,
    ) -> Result<()> {
        self.tracker
            .update_phase_progress(pool, scan_id, items_processed, items_total, current_item, details)
            .await?;

        let Some(scan) = scans::get_scan(pool, scan_id).await? else {
            return Ok(());
        };
        let Some(phase) = scan.current_phase.clone() else {
            return Ok(());
        };

        let progress_percentage = scan
            .phase_progress
            .as_ref()
            .and_then(|p| p.get(&phase))
            .and_then(|p| p.get("progress_percentage"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        self.broadcaster
            .publish(
                scan_id,
                ProgressEvent::ProgressUpdate {
                    scan_id,
                    phase,
                    items_processed,
                    items_total: items_total.unwrap_or(0),
                    current_item: current_item.map(String::from),
                    progress_percentage,
                    overall_progress: overall_progress(
                        scan.pages_processed,
                        scan.total_pages_found,
                        &scan.status,
                    ),
                    total_pages_found: scan.total_pages_found,
                    pages_processed: scan.pages_processed,
                    estimated_completion: scan.estimated_completion.map(|t| t.to_rfc3339()),
                },
            )
            .await;
        Ok(())
    }

    pub async fn complete_phase(
        &self,
        pool: &PgPool,
        scan_id: i64,
        phase: &str,
        summary: Option<Value>,
    ) -> Result<()> {
        self.tracker
            .complete_phase(pool, scan_id, phase, summary.clone())
            .await?;
        self.broadcaster
            .publish(
                scan_id,
                ProgressEvent::PhaseComplete {
                    scan_id,
                    phase: phase.to_string(),
                    summary,
                },
            )
            .await;
        Ok(())
    }

    pub async fn report_error(
        &self,
        pool: &PgPool,
        scan_id: i64,
        message: &str,
        details: Option<Value>,
    ) -> Result<()> {
        self.tracker
            .report_error(pool, scan_id, message, details.clone())
            .await?;

        let phase = scans::get_scan(pool, scan_id)
            .await?
            .and_then(|s| s.current_phase);
        self.broadcaster
            .publish(
                scan_id,
                ProgressEvent::Error {
                    scan_id,
                    message: message.to_string(),
                    phase,
                    details,
                },
            )
            .await;
        Ok(())
    }

    /// Announce a scored page; only biased pages are broadcast.
    pub async fn report_page_result(
        &self,
        scan_id: i64,
        page_url: &str,
        has_bias: bool,
        bias_details: Option<Value>,
    ) {
        if !has_bias {
            return;
        }
        tracing::info!(scan_id, page_url, "bias detected on page");
        self.broadcaster
            .publish(
                scan_id,
                ProgressEvent::PageResult {
                    scan_id,
                    page_url: page_url.to_string(),
                    has_bias,
                    bias_details,
                },
            )
            .await;
    }
}

fn overall_progress(pages_processed: i64, total_pages_found: i64, status: &str) -> f64 {
    if total_pages_found > 0 {
        (pages_processed as f64 / total_pages_found as f64) * 100.0
    } else if status == "completed" {
        100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_progress_ratio() {
        assert_eq!(overall_progress(50, 200, "processing"), 25.0);
        assert_eq!(overall_progress(0, 0, "processing"), 0.0);
        assert_eq!(overall_progress(0, 0, "completed"), 100.0);
    }
}
