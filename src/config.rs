use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use sqlx::any::{AnyPoolOptions, Any};
use sqlx::Pool;

use crate::dialect::Dialect;
use crate::error::QueueError;

/// A pool config object, designed to be passable across API boundaries.
/// Unlike the single-dialect teacher, `db_url`'s scheme (`sqlite:` or
/// `postgres:`) selects the backend at runtime via `sqlx::Any`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,         // Default to 10
    pub min_connections: Option<u32>,         // Default to 1
    pub acquire_timeout_seconds: Option<u64>, // Default to 30
    pub max_lifetime_seconds: Option<u64>,    // Default to 300
    pub idle_timeout_seconds: Option<u64>,    // Default to 60
}

impl PoolConfig {
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            max_connections: None,
            min_connections: None,
            acquire_timeout_seconds: None,
            max_lifetime_seconds: None,
            idle_timeout_seconds: None,
        }
    }

    pub fn dialect(&self) -> Result<Dialect, QueueError> {
        Dialect::from_url(&self.db_url)
    }

    pub async fn connect(&self) -> Result<Pool<Any>, QueueError> {
        sqlx::any::install_default_drivers();
        AnyPoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(StdDuration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(StdDuration::from_secs(
                self.idle_timeout_seconds.unwrap_or(60),
            ))
            .acquire_timeout(StdDuration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ))
            .connect(&self.db_url)
            .await
            .map_err(QueueError::PoolCreation)
    }
}

/// Per-handler-type worker tuning. `job_count_limit` is the sole
/// backpressure gate described in §4.4/§5 of the specification: once that
/// many handlers are in flight, the main loop sleeps a poll interval
/// instead of dequeuing more work.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerConfig {
    pub max_retries: u16,            // Default 3
    pub timeout_seconds: u64,        // Default 5 -- initial visibility lease
    pub extend_delay_seconds: u64,   // Default 5
    pub poll_interval_millis: u64,   // Default 100
    pub job_count_limit: usize,      // Default: number of CPUs
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_seconds: 5,
            extend_delay_seconds: 5,
            poll_interval_millis: 100,
            job_count_limit: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.timeout_seconds == 0 {
            return Err(QueueError::InvalidConfig(
                "timeout_seconds must be > 0".to_string(),
            ));
        }
        if self.extend_delay_seconds == 0 {
            return Err(QueueError::InvalidConfig(
                "extend_delay_seconds must be > 0".to_string(),
            ));
        }
        if self.poll_interval_millis == 0 {
            return Err(QueueError::InvalidConfig(
                "poll_interval_millis must be > 0".to_string(),
            ));
        }
        if self.job_count_limit == 0 {
            return Err(QueueError::InvalidConfig(
                "job_count_limit must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Dedup-queue-only policy knobs (§4.3).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DedupConfig {
    pub dedupe_enabled: bool,      // Default true
    pub block_repeats_on_dlq: bool, // Default true
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            dedupe_enabled: true,
            block_repeats_on_dlq: true,
        }
    }
}

/// Top-level service configuration: composes a pool, a queue name, worker
/// tuning, and (for the dedup variant) the dedup policy knobs.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub pool: PoolConfig,
    pub queue_name: String,
    pub max_workers: usize, // Default 1
    pub worker: WorkerConfig,
    pub dedup: Option<DedupConfig>, // None => plain queue, Some => dedup queue
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_workers == 0 {
            return Err(QueueError::InvalidConfig(
                "max_workers must be >= 1".to_string(),
            ));
        }
        if self.queue_name.is_empty() {
            return Err(QueueError::InvalidConfig(
                "queue_name must not be empty".to_string(),
            ));
        }
        self.worker.validate()
    }
}
