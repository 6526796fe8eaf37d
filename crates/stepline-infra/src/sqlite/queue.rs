//! Durable dispatch queue in the `dispatch_queue` table.
//!
//! Rows survive restarts, so executions enqueued by one process can be
//! picked up by a worker pool started later. Dequeue is a single
//! `DELETE ... RETURNING` on the writer connection; each row goes to one
//! caller. Waiting workers poll at `poll_interval` and are woken early by
//! enqueues from the same process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use stepline_core::execution::queue::{DispatchQueue, QueueError};
use tokio::sync::Notify;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteDispatchQueue {
    pool: DatabasePool,
    poll_interval: Duration,
    notify: Arc<Notify>,
}

impl SqliteDispatchQueue {
    pub fn new(pool: DatabasePool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Number of queued rows, including those not yet available.
    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dispatch_queue")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(backend)?;
        Ok(count.0)
    }

    async fn insert(&self, execution_id: Uuid, delay: Duration) -> Result<(), QueueError> {
        let now = Utc::now();
        let delay = TimeDelta::from_std(delay).map_err(|e| QueueError::Backend(e.to_string()))?;
        let available_at = now.checked_add_signed(delay).unwrap_or(now);

        sqlx::query(
            "INSERT INTO dispatch_queue (execution_id, available_at, enqueued_at) VALUES (?, ?, ?)",
        )
        .bind(execution_id.to_string())
        .bind(format_datetime(&available_at))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        self.notify.notify_one();
        Ok(())
    }

    async fn try_dequeue(&self) -> Result<Option<Uuid>, QueueError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"DELETE FROM dispatch_queue
               WHERE seq = (
                   SELECT seq FROM dispatch_queue
                   WHERE available_at <= ?
                   ORDER BY available_at ASC, seq ASC
                   LIMIT 1
               )
               RETURNING execution_id"#,
        )
        .bind(format_datetime(&Utc::now()))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(backend)?;

        row.map(|(id,)| parse_uuid(&id).map_err(|e| QueueError::Backend(e.to_string())))
            .transpose()
    }
}

fn backend(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

impl DispatchQueue for SqliteDispatchQueue {
    async fn enqueue(&self, execution_id: Uuid) -> Result<(), QueueError> {
        self.insert(execution_id, Duration::ZERO).await
    }

    async fn enqueue_after(&self, execution_id: Uuid, delay: Duration) -> Result<(), QueueError> {
        self.insert(execution_id, delay).await?;
        // Delayed rows are found by polling once due.
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Uuid>, QueueError> {
        loop {
            if let Some(id) = self.try_dequeue().await? {
                return Ok(Some(id));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
