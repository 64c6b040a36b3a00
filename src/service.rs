//! Service facade (§4.5): the single entry point an embedding application
//! talks to. Validates configuration, runs idempotent schema setup,
//! constructs the queue backend and worker pool, and exposes
//! `start`/`stop`/`register`/`enqueue`. A service can be started once;
//! `stop` drains in-flight handlers up to a deadline and, once stopped,
//! every subsequent `enqueue` fails fast rather than silently queuing work
//! nobody will ever claim.

use std::sync::{Arc, Mutex};

use chrono::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::db::Database;
use crate::dedup::DedupQueue;
use crate::error::{JobError, QueueError};
use crate::hash::sha256_hasher;
use crate::plain::PlainQueue;
use crate::types::{Bytes, JobId, TraceContext};
use crate::worker::{Backend, HandlerOptions, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Running,
    Stopped,
}

pub struct Service {
    pool: Arc<WorkerPool>,
    max_workers: usize,
    cancel: CancellationToken,
    state: Mutex<State>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    drain_deadline: std::time::Duration,
}

impl Service {
    pub async fn new(config: ServiceConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let db = Database::connect(&config.pool).await?;
        let max_receive = config.worker.max_retries as i32 + 1;

        let backend = match config.dedup {
            Some(dedup_config) => Backend::Dedup(DedupQueue::new(
                db,
                config.queue_name.clone(),
                max_receive,
                dedup_config,
                sha256_hasher(),
            )),
            None => Backend::Plain(PlainQueue::new(db, config.queue_name.clone(), max_receive)),
        };

        let pool = Arc::new(WorkerPool::new(backend, config.worker.clone()));

        Ok(Self {
            pool,
            max_workers: config.max_workers,
            cancel: CancellationToken::new(),
            state: Mutex::new(State::NotStarted),
            handles: Mutex::new(Vec::new()),
            drain_deadline: std::time::Duration::from_secs(30),
        })
    }

    /// Overrides the default 30s drain deadline `stop` waits for in-flight
    /// handlers to finish.
    pub fn with_drain_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<(), JobError>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        self.pool.register(name, handler)
    }

    pub fn register_with<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        options: HandlerOptions,
    ) -> Result<(), JobError>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        self.pool.register_with(name, handler, options)
    }

    /// Runs idempotent schema setup and spawns `max_workers` independent
    /// copies of the claim loop, all competing for work against the same
    /// `job_count_limit`-bounded handler concurrency. Returns
    /// `QueueError::AlreadyStarted` on a second call.
    pub async fn start(&self) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::NotStarted {
                return Err(QueueError::AlreadyStarted);
            }
            *state = State::Running;
        }

        self.pool.setup().await?;

        let mut handles = self.handles.lock().unwrap();
        for _ in 0..self.max_workers {
            let pool = Arc::clone(&self.pool);
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move { pool.start(cancel).await }));
        }
        Ok(())
    }

    /// Signals the main loop to stop claiming new work and waits up to the
    /// configured deadline for in-flight handlers to finish.
    pub async fn stop(&self) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Running {
                return Err(QueueError::NotStarted);
            }
            *state = State::Stopped;
        }

        self.cancel.cancel();
        self.pool.drain(self.drain_deadline).await?;

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    pub async fn enqueue(
        &self,
        task_name: &str,
        message: &[u8],
        trace: Option<TraceContext>,
        delay: Duration,
    ) -> Result<Option<JobId>, JobError> {
        if *self.state.lock().unwrap() == State::Stopped {
            return Err(JobError::Queue(QueueError::Stopping));
        }
        self.pool.enqueue(task_name, message, trace, delay).await
    }

    pub async fn enqueue_tx(
        &self,
        task_name: &str,
        message: &[u8],
        trace: Option<TraceContext>,
        delay: Duration,
    ) -> Result<Option<JobId>, JobError> {
        if *self.state.lock().unwrap() == State::Stopped {
            return Err(JobError::Queue(QueueError::Stopping));
        }
        self.pool.enqueue_tx(task_name, message, trace, delay).await
    }
}
