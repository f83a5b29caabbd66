//! Durable queue service
//!
//! Four durable work queues backed by a single `queue_messages` table:
//! `scan_tasks`, `changed_files`, `doc_processing` and `llm_scoring`.
//!
//! Delivery contract:
//! - messages survive process restarts (rows, not memory);
//! - one message in flight per consumer (`FOR UPDATE SKIP LOCKED` claim),
//!   so queue length reflects true backlog for external autoscalers;
//! - manual acknowledgement: `ack` removes the row, `nack(requeue=true)`
//!   returns it to pending, `nack(requeue=false)` dead-letters it;
//! - a claimed message whose lease expires (worker crash) returns to
//!   pending on the next sweep.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};

// ============================================================================
// Queue names
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    ScanTasks,
    ChangedFiles,
    DocProcessing,
    LlmScoring,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ScanTasks => "scan_tasks",
            QueueName::ChangedFiles => "changed_files",
            QueueName::DocProcessing => "doc_processing",
            QueueName::LlmScoring => "llm_scoring",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One claimed message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

/// Message handler seam implemented by each worker.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> Result<()>;
}

// ============================================================================
// Schema
// ============================================================================

/// Idempotent schema creation for the queue fabric.
pub async fn create_queue_tables(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id BIGSERIAL PRIMARY KEY,
            queue TEXT NOT NULL,
            payload JSONB NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            attempts INT NOT NULL DEFAULT 0,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            leased_until TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_messages_claim ON queue_messages(queue, state, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Connect the queue backend: a dedicated database when `QUEUE_HOST` is
/// configured, otherwise the primary pool.
pub async fn connect_queue_pool(config: &QueueConfig, primary: &PgPool) -> Result<PgPool> {
    match &config.url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .map_err(|e| Error::queue(e.to_string()))?;
            create_queue_tables(&pool).await?;
            Ok(pool)
        }
        None => Ok(primary.clone()),
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct QueueService {
    pool: PgPool,
    config: QueueConfig,
}

impl QueueService {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    pub async fn publish<T: Serialize>(&self, queue: QueueName, message: &T) -> Result<()> {
        let payload = serde_json::to_value(message)?;
        sqlx::query("INSERT INTO queue_messages (queue, payload) VALUES ($1, $2)")
            .bind(queue.as_str())
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::queue(e.to_string()))?;
        debug!(%queue, "published message");
        Ok(())
    }

    /// Publish a batch atomically; either all messages land or none do.
    pub async fn publish_batch<T: Serialize>(
        &self,
        queue: QueueName,
        messages: &[T],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::queue(e.to_string()))?;
        for message in messages {
            let payload = serde_json::to_value(message)?;
            sqlx::query("INSERT INTO queue_messages (queue, payload) VALUES ($1, $2)")
                .bind(queue.as_str())
                .bind(&payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::queue(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| Error::queue(e.to_string()))?;

        info!(%queue, count = messages.len(), "published message batch");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Claiming and acknowledgement
    // ------------------------------------------------------------------

    /// Claim at most one pending message, leasing it for the configured
    /// interval. Expired leases are recycled first so crashed workers'
    /// messages are redelivered.
    pub async fn claim(&self, queue: QueueName) -> Result<Option<Delivery>> {
        self.recycle_expired_leases(queue).await?;

        let lease_until = Utc::now() + ChronoDuration::seconds(self.config.lease_seconds);
        let row: Option<(i64, serde_json::Value, i32)> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET state = 'leased', leased_until = $1, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = $2 AND state = 'pending'
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(lease_until)
        .bind(queue.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::queue(e.to_string()))?;

        Ok(row.map(|(id, payload, attempts)| Delivery {
            id,
            payload,
            attempts,
        }))
    }

    pub async fn ack(&self, delivery_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::queue(e.to_string()))?;
        Ok(())
    }

    pub async fn nack(&self, delivery_id: i64, requeue: bool) -> Result<()> {
        let state = if requeue { "pending" } else { "dead" };
        sqlx::query("UPDATE queue_messages SET state = $1, leased_until = NULL WHERE id = $2")
            .bind(state)
            .bind(delivery_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::queue(e.to_string()))?;
        Ok(())
    }

    async fn recycle_expired_leases(&self, queue: QueueName) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages SET state = 'pending', leased_until = NULL
            WHERE queue = $1 AND state = 'leased' AND leased_until < $2
            "#,
        )
        .bind(queue.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::queue(e.to_string()))?;

        let recycled = result.rows_affected();
        if recycled > 0 {
            warn!(%queue, count = recycled, "recycled messages with expired leases");
        }
        Ok(recycled)
    }

    // ------------------------------------------------------------------
    // Management
    // ------------------------------------------------------------------

    /// Pending backlog length, the signal external autoscalers watch.
    pub async fn len(&self, queue: QueueName) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = $1 AND state = 'pending'",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::queue(e.to_string()))?;
        Ok(count)
    }

    /// Drop all pending messages from a queue. Best effort: in-flight
    /// messages stay with their consumers, which short-circuit on the
    /// scan's cancellation flag.
    pub async fn purge(&self, queue: QueueName) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE queue = $1 AND state = 'pending'")
                .bind(queue.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| Error::queue(e.to_string()))?;

        let purged = result.rows_affected();
        info!(%queue, count = purged, "purged queue");
        Ok(purged)
    }

    /// Drop pending messages belonging to one scan.
    pub async fn purge_scan(&self, queue: QueueName, scan_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_messages
            WHERE queue = $1 AND state = 'pending' AND (payload ->> 'scan_id')::bigint = $2
            "#,
        )
        .bind(queue.as_str())
        .bind(scan_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::queue(e.to_string()))?;

        let purged = result.rows_affected();
        info!(%queue, scan_id, count = purged, "purged scan messages");
        Ok(purged)
    }

    // ------------------------------------------------------------------
    // Consumption
    // ------------------------------------------------------------------

    /// Consume messages one at a time until `shutdown` flips.
    ///
    /// Handler outcomes map onto acknowledgements: Ok acks; a validation
    /// error dead-letters; everything else requeues. Backend failures are
    /// retried with exponential backoff (2^attempt seconds, capped) up to
    /// the configured attempt limit, then surfaced.
    pub async fn consume(
        &self,
        queue: QueueName,
        handler: &dyn QueueHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(%queue, "starting to consume messages");
        let mut failed_attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!(%queue, "shutdown requested, stopping consumption");
                return Ok(());
            }

            let delivery = match self.claim(queue).await {
                Ok(delivery) => {
                    failed_attempts = 0;
                    delivery
                }
                Err(err) => {
                    failed_attempts += 1;
                    if failed_attempts >= self.config.max_connect_attempts {
                        error!(%queue, %err, "queue backend unreachable, giving up");
                        return Err(err);
                    }
                    let delay = Duration::from_secs(2u64.pow(failed_attempts).min(60));
                    warn!(
                        %queue, %err, attempt = failed_attempts,
                        delay_secs = delay.as_secs(),
                        "queue backend error, reconnecting after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            let Some(delivery) = delivery else {
                // Idle; wait out the poll interval unless shutdown arrives.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            // The in-flight message is always finished before shutdown is
            // honoured.
            match handler.handle(delivery.payload.clone()).await {
                Ok(()) => {
                    self.ack(delivery.id).await?;
                }
                Err(Error::Validation(msg)) => {
                    error!(%queue, delivery_id = delivery.id, %msg, "poison message, dead-lettering");
                    self.nack(delivery.id, false).await?;
                }
                Err(err) => {
                    warn!(
                        %queue, delivery_id = delivery.id, attempts = delivery.attempts, %err,
                        "handler failed, requeueing message"
                    );
                    self.nack(delivery.id, true).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names() {
        assert_eq!(QueueName::ScanTasks.as_str(), "scan_tasks");
        assert_eq!(QueueName::ChangedFiles.as_str(), "changed_files");
        assert_eq!(QueueName::DocProcessing.as_str(), "doc_processing");
        assert_eq!(QueueName::LlmScoring.as_str(), "llm_scoring");
    }
}
