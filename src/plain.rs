//! Plain queue storage (§4.2): a single logical `jobqueue` table plus its
//! `jobqueue_dead` companion. No dedup -- every `send` creates a new row.

use chrono::Duration;
use sqlx::Row;
use uuid::Uuid;

use crate::db::{now_ms, Database};
use crate::error::{JobError, QueueError};
use crate::types::{DeadLetterReason, Job, JobId};

#[derive(Clone)]
pub struct PlainQueue {
    db: Database,
    queue: String,
    max_receive: i32,
}

impl PlainQueue {
    pub fn new(db: Database, queue: impl Into<String>, max_receive: i32) -> Self {
        Self {
            db,
            queue: queue.into(),
            max_receive,
        }
    }

    pub async fn setup(&self) -> Result<(), QueueError> {
        self.db.setup().await
    }

    /// Inserts a row with `timeout = now + delay`. `delay` must be
    /// non-negative -- a negative delay is a programmer error, not a
    /// recoverable condition.
    pub async fn send(&self, body: &[u8], delay: Duration) -> Result<JobId, JobError> {
        if delay < Duration::zero() {
            return Err(JobError::NegativeDelay(delay.num_milliseconds()));
        }
        let id = Uuid::now_v7().to_string();
        let now = now_ms();
        let timeout = now + delay.num_milliseconds();
        let sql = self.db.rebind(
            "INSERT INTO jobqueue (id, created, updated, queue, body, timeout, received) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        );
        sqlx::query(&sql)
            .bind(&id)
            .bind(now)
            .bind(now)
            .bind(&self.queue)
            .bind(body)
            .bind(timeout)
            .execute(&self.db.pool)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;
        Ok(id)
    }

    /// Atomically claims the single oldest eligible row: bumps `received`,
    /// extends `timeout`, and returns its body. `None` when nothing is
    /// eligible. The `UPDATE ... WHERE id = (SELECT ...)` idiom is the
    /// entire claim-atomicity story -- no `FOR UPDATE SKIP LOCKED`, so the
    /// same statement text works on both dialects.
    pub async fn receive(&self, visibility: Duration) -> Result<Option<Job>, JobError> {
        let now = now_ms();
        let new_timeout = now + visibility.num_milliseconds();
        let updated = now_ms();
        let sql = self.db.rebind(
            "UPDATE jobqueue SET timeout = ?, received = received + 1, updated = ? \
             WHERE id = ( \
                 SELECT id FROM jobqueue \
                 WHERE queue = ? AND timeout <= ? AND received < ? \
                 ORDER BY created ASC, id ASC \
                 LIMIT 1 \
             ) \
             RETURNING id, body, received",
        );
        let row = sqlx::query(&sql)
            .bind(new_timeout)
            .bind(updated)
            .bind(&self.queue)
            .bind(now)
            .bind(self.max_receive)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(Job {
            id: row.try_get::<String, _>("id").map_err(|e| JobError::Queue(e.into()))?,
            body: row.try_get::<Vec<u8>, _>("body").map_err(|e| JobError::Queue(e.into()))?,
            received: row.try_get::<i32, _>("received").map_err(|e| JobError::Queue(e.into()))?,
        }))
    }

    /// Polls `receive` at `interval` until a message shows up or
    /// `cancelled` fires. Treats cancellation as a graceful `None`, not an
    /// error (§5).
    pub async fn receive_and_wait(
        &self,
        visibility: Duration,
        interval: std::time::Duration,
        cancelled: &tokio_util::sync::CancellationToken,
    ) -> Result<Option<Job>, JobError> {
        loop {
            if let Some(job) = self.receive(visibility).await? {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancelled.cancelled() => return Ok(None),
            }
        }
    }

    /// Idempotent: silently does nothing if the row no longer exists (it
    /// may already have been deleted or dead-lettered by the time the
    /// extension lands).
    pub async fn extend(&self, id: &str, delay: Duration) -> Result<(), JobError> {
        let new_timeout = now_ms() + delay.num_milliseconds();
        let sql = self
            .db
            .rebind("UPDATE jobqueue SET timeout = ?, updated = ? WHERE id = ? AND queue = ?");
        sqlx::query(&sql)
            .bind(new_timeout)
            .bind(now_ms())
            .bind(id)
            .bind(&self.queue)
            .execute(&self.db.pool)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), JobError> {
        let sql = self.db.rebind("DELETE FROM jobqueue WHERE id = ? AND queue = ?");
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(&self.queue)
            .execute(&self.db.pool)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Copies the row into `jobqueue_dead`, then deletes it from the live
    /// table, inside a single transaction. Fails with `NotFound` if the
    /// live row is already gone.
    pub async fn move_to_dead_letter(
        &self,
        id: &str,
        job_name: &str,
        reason: DeadLetterReason,
        error_message: &str,
    ) -> Result<(), JobError> {
        let mut txn = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        let select_sql = self
            .db
            .rebind("SELECT id, created, updated, queue, body, timeout, received FROM jobqueue WHERE id = ? AND queue = ?");
        let row = sqlx::query(&select_sql)
            .bind(id)
            .bind(&self.queue)
            .fetch_optional(&mut *txn)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        let Some(row) = row else {
            return Err(JobError::NotFound(id.to_string()));
        };

        let created: i64 = row.try_get("created").map_err(|e| JobError::Queue(e.into()))?;
        let updated: i64 = row.try_get("updated").map_err(|e| JobError::Queue(e.into()))?;
        let queue: String = row.try_get("queue").map_err(|e| JobError::Queue(e.into()))?;
        let body: Vec<u8> = row.try_get("body").map_err(|e| JobError::Queue(e.into()))?;
        let timeout: i64 = row.try_get("timeout").map_err(|e| JobError::Queue(e.into()))?;
        let received: i32 = row.try_get("received").map_err(|e| JobError::Queue(e.into()))?;

        let insert_sql = self.db.rebind(
            "INSERT INTO jobqueue_dead \
             (id, created, updated, queue, body, timeout, received, job_name, failure_reason, error_message, moved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        sqlx::query(&insert_sql)
            .bind(id)
            .bind(created)
            .bind(updated)
            .bind(&queue)
            .bind(&body)
            .bind(timeout)
            .bind(received)
            .bind(job_name)
            .bind(reason.as_str())
            .bind(error_message)
            .bind(now_ms())
            .execute(&mut *txn)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        let delete_sql = self.db.rebind("DELETE FROM jobqueue WHERE id = ? AND queue = ?");
        sqlx::query(&delete_sql)
            .bind(id)
            .bind(&self.queue)
            .execute(&mut *txn)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        txn.commit().await.map_err(|e| JobError::Queue(e.into()))?;
        Ok(())
    }
}
