//! Dedup queue storage (§4.3): content-addressed permanent deduplication on
//! top of a per-queue `(task name, content hash)` namespace. Unlike the
//! plain queue, `send` here can be a no-op -- an identical payload that has
//! already completed (or already dead-lettered, when `block_repeats_on_dlq`
//! is set) is silently dropped rather than re-enqueued.

use sqlx::Row;
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::db::{now_ms, Database};
use crate::error::{JobError, QueueError};
use crate::hash::KeyHasher;
use crate::types::{DeadLetterReason, Envelope, Job, JobId};

const STATUS_DONE: i32 = 1;
const STATUS_DEAD: i32 = 2;

#[derive(Clone)]
pub struct DedupQueue {
    db: Database,
    queue: String,
    max_receive: i32,
    config: DedupConfig,
    hasher: KeyHasher,
}

impl DedupQueue {
    pub fn new(
        db: Database,
        queue: impl Into<String>,
        max_receive: i32,
        config: DedupConfig,
        hasher: KeyHasher,
    ) -> Self {
        Self {
            db,
            queue: queue.into(),
            max_receive,
            config,
            hasher,
        }
    }

    pub async fn setup(&self) -> Result<(), QueueError> {
        self.db.setup().await?;
        let sql = self.db.dialect.insert_ignore(
            "queues",
            &["queue", "dedupe_enabled"],
            &["?", "?"],
        );
        sqlx::query(&sql)
            .bind(&self.queue)
            .bind(self.config.dedupe_enabled)
            .execute(&self.db.pool)
            .await
            .map_err(QueueError::from)?;
        Ok(())
    }

    async fn namespace_id(&self, task_name: &str) -> Result<i64, JobError> {
        let insert_sql = self.db.dialect.insert_ignore(
            "job_ns",
            &["queue", "name"],
            &["?", "?"],
        );
        sqlx::query(&insert_sql)
            .bind(&self.queue)
            .bind(task_name)
            .execute(&self.db.pool)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        let select_sql = self.db.rebind("SELECT id FROM job_ns WHERE queue = ? AND name = ?");
        let row = sqlx::query(&select_sql)
            .bind(&self.queue)
            .bind(task_name)
            .fetch_one(&self.db.pool)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;
        row.try_get("id").map_err(|e| JobError::Queue(e.into()))
    }

    /// Computes the dedup key for an envelope body: the SHA-256 (by
    /// default) of the decoded `message` field, not the raw envelope bytes,
    /// so trace-context churn never defeats dedup (§9).
    fn dedup_key(&self, envelope: &Envelope) -> Result<Vec<u8>, JobError> {
        let message = envelope.message_bytes()?;
        Ok((self.hasher)(&message))
    }

    /// Enqueues `body` unless dedup is on for this queue and an identical
    /// payload has already completed (or dead-lettered, when
    /// `block_repeats_on_dlq`). Returns `None` when the send was
    /// suppressed.
    pub async fn send(&self, body: &[u8]) -> Result<Option<JobId>, JobError> {
        let envelope = Envelope::decode(body)?;
        let ns_id = self.namespace_id(&envelope.name).await?;
        let key = self.dedup_key(&envelope)?;

        if self.config.dedupe_enabled {
            let select_sql = self
                .db
                .rebind("SELECT status FROM job_done WHERE ns_id = ? AND key = ?");
            let done = sqlx::query(&select_sql)
                .bind(ns_id)
                .bind(&key)
                .fetch_optional(&self.db.pool)
                .await
                .map_err(|e| JobError::Queue(e.into()))?;

            if let Some(row) = done {
                let status: i32 = row.try_get("status").map_err(|e| JobError::Queue(e.into()))?;
                if status == STATUS_DONE {
                    return Ok(None);
                }
                if status == STATUS_DEAD && self.config.block_repeats_on_dlq {
                    return Ok(None);
                }
            }
        }

        let id = Uuid::now_v7().to_string();
        let now = now_ms() / 1000;
        // Unconditional: `jobs.UNIQUE(ns_id, key)` enforces the live-duplicate
        // gate regardless of `dedupe_enabled`, which only governs the
        // `job_done` consultation/write above. A plain INSERT here would
        // surface that constraint as a raw query error instead of the
        // spec's silent `Ok(None)` drop.
        let insert_sql = self.db.dialect.insert_ignore(
            "jobs",
            &["id", "ns_id", "key", "body", "created_s", "avail_s", "attempts"],
            &["?", "?", "?", "?", "?", "?", "?"],
        );
        let result = sqlx::query(&insert_sql)
            .bind(&id)
            .bind(ns_id)
            .bind(&key)
            .bind(body)
            .bind(now)
            .bind(now)
            .bind(0_i32)
            .execute(&self.db.pool)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        if result.rows_affected() == 0 {
            // Another in-flight (not-yet-done) job already holds this key.
            return Ok(None);
        }
        Ok(Some(id))
    }

    pub async fn receive(&self, visibility_s: i64) -> Result<Option<Job>, JobError> {
        let now = now_ms() / 1000;
        let new_avail = now + visibility_s;
        let sql = self.db.rebind(
            "UPDATE jobs SET avail_s = ?, attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT jobs.id FROM jobs \
                 JOIN job_ns ON job_ns.id = jobs.ns_id \
                 WHERE job_ns.queue = ? AND jobs.avail_s <= ? AND jobs.attempts < ? \
                 ORDER BY jobs.created_s ASC, jobs.id ASC \
                 LIMIT 1 \
             ) \
             RETURNING id, body, attempts",
        );
        let row = sqlx::query(&sql)
            .bind(new_avail)
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
            received: row.try_get::<i32, _>("attempts").map_err(|e| JobError::Queue(e.into()))?,
        }))
    }

    /// Polls `receive` at `interval` until a message shows up or
    /// `cancelled` fires. Treats cancellation as a graceful `None`, not an
    /// error (§5).
    pub async fn receive_and_wait(
        &self,
        visibility_s: i64,
        interval: std::time::Duration,
        cancelled: &tokio_util::sync::CancellationToken,
    ) -> Result<Option<Job>, JobError> {
        loop {
            if let Some(job) = self.receive(visibility_s).await? {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancelled.cancelled() => return Ok(None),
            }
        }
    }

    pub async fn extend(&self, id: &str, visibility_s: i64) -> Result<(), JobError> {
        let new_avail = now_ms() / 1000 + visibility_s;
        let sql = self.db.rebind("UPDATE jobs SET avail_s = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(new_avail)
            .bind(id)
            .execute(&self.db.pool)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;
        Ok(())
    }

    /// Removes the live row and, when dedup is enabled, permanently records
    /// `(ns_id, key) -> done` so future identical payloads are suppressed.
    pub async fn delete(&self, id: &str) -> Result<(), JobError> {
        let mut txn = self.db.pool.begin().await.map_err(|e| JobError::Queue(e.into()))?;

        let select_sql = self.db.rebind("SELECT ns_id, key FROM jobs WHERE id = ?");
        let row = sqlx::query(&select_sql)
            .bind(id)
            .fetch_optional(&mut *txn)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;
        let Some(row) = row else {
            return Err(JobError::NotFound(id.to_string()));
        };
        let ns_id: i64 = row.try_get("ns_id").map_err(|e| JobError::Queue(e.into()))?;
        let key: Vec<u8> = row.try_get("key").map_err(|e| JobError::Queue(e.into()))?;

        let delete_sql = self.db.rebind("DELETE FROM jobs WHERE id = ?");
        sqlx::query(&delete_sql)
            .bind(id)
            .execute(&mut *txn)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        if self.config.dedupe_enabled {
            let done_sql = self.db.dialect.insert_ignore(
                "job_done",
                &["ns_id", "key", "status", "done_s"],
                &["?", "?", "?", "?"],
            );
            sqlx::query(&done_sql)
                .bind(ns_id)
                .bind(&key)
                .bind(STATUS_DONE)
                .bind(now_ms() / 1000)
                .execute(&mut *txn)
                .await
                .map_err(|e| JobError::Queue(e.into()))?;
        }

        txn.commit().await.map_err(|e| JobError::Queue(e.into()))?;
        Ok(())
    }

    /// Copies the row to `job_dead`, removes it from `jobs`, and -- when
    /// both dedup and `block_repeats_on_dlq` are enabled -- records a
    /// permanent `done_s` status=2 entry so identical payloads are refused
    /// rather than silently retried forever.
    pub async fn move_to_dead_letter(
        &self,
        id: &str,
        reason: DeadLetterReason,
        error_message: &str,
    ) -> Result<(), JobError> {
        let mut txn = self.db.pool.begin().await.map_err(|e| JobError::Queue(e.into()))?;

        let select_sql = self
            .db
            .rebind("SELECT ns_id, key, body, attempts FROM jobs WHERE id = ?");
        let row = sqlx::query(&select_sql)
            .bind(id)
            .fetch_optional(&mut *txn)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;
        let Some(row) = row else {
            return Err(JobError::NotFound(id.to_string()));
        };
        let ns_id: i64 = row.try_get("ns_id").map_err(|e| JobError::Queue(e.into()))?;
        let key: Vec<u8> = row.try_get("key").map_err(|e| JobError::Queue(e.into()))?;
        let body: Vec<u8> = row.try_get("body").map_err(|e| JobError::Queue(e.into()))?;
        let attempts: i32 = row.try_get("attempts").map_err(|e| JobError::Queue(e.into()))?;

        let insert_sql = self.db.rebind(
            "INSERT INTO job_dead (id, ns_id, key, body, attempts, reason, error, moved_s) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        );
        sqlx::query(&insert_sql)
            .bind(id)
            .bind(ns_id)
            .bind(&key)
            .bind(&body)
            .bind(attempts)
            .bind(reason.as_str())
            .bind(error_message)
            .bind(now_ms() / 1000)
            .execute(&mut *txn)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        let delete_sql = self.db.rebind("DELETE FROM jobs WHERE id = ?");
        sqlx::query(&delete_sql)
            .bind(id)
            .execute(&mut *txn)
            .await
            .map_err(|e| JobError::Queue(e.into()))?;

        if self.config.dedupe_enabled && self.config.block_repeats_on_dlq {
            let done_sql = self.db.dialect.insert_ignore(
                "job_done",
                &["ns_id", "key", "status", "done_s"],
                &["?", "?", "?", "?"],
            );
            sqlx::query(&done_sql)
                .bind(ns_id)
                .bind(&key)
                .bind(STATUS_DEAD)
                .bind(now_ms() / 1000)
                .execute(&mut *txn)
                .await
                .map_err(|e| JobError::Queue(e.into()))?;
        }

        txn.commit().await.map_err(|e| JobError::Queue(e.into()))?;
        Ok(())
    }
}
