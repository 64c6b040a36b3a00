//! Worker pool (§4.4): claims jobs from a backend (plain or dedup queue),
//! decodes the envelope, dispatches to a registered handler, and keeps the
//! lease alive for the duration of the call. `jobCountLimit` in-flight
//! handlers is the sole backpressure gate -- once that many are running the
//! main loop just sleeps a poll interval instead of claiming more.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use chrono::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::dedup::DedupQueue;
use crate::error::{is_permanent, JobError, QueueError};
use crate::plain::PlainQueue;
use crate::trace;
use crate::types::{Bytes, DeadLetterReason, Envelope, Job, JobId, TraceContext};

type HandlerFuture = BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>;

/// A registered handler routine: takes the decoded `message` bytes, returns
/// a boxed error on failure. Wrap the error in
/// `crate::error::PermanentError` to skip the retry ladder entirely.
pub type Handler = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

/// Called exactly once per terminal failure (permanent error or retries
/// exhausted), before the job is moved to the dead-letter table.
pub type OnFailure = Arc<dyn Fn(&Job, &(dyn std::error::Error + Send + Sync)) + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerOptions {
    pub on_failure: Option<OnFailure>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = Some(on_failure);
        self
    }
}

struct Registration {
    handler: Handler,
    options: HandlerOptions,
}

/// The storage backend a worker pool is bound to. `Plain` and `Dedup` are
/// the only two queue flavors (§4.2/§4.3); this enum lets `WorkerPool` stay
/// generic over which one it was constructed with.
#[derive(Clone)]
pub enum Backend {
    Plain(PlainQueue),
    Dedup(DedupQueue),
}

impl Backend {
    pub async fn setup(&self) -> Result<(), QueueError> {
        match self {
            Backend::Plain(q) => q.setup().await,
            Backend::Dedup(q) => q.setup().await,
        }
    }

    /// Dedup queues have no notion of a delayed send (§9); `delay` is
    /// ignored on that path and the message becomes immediately eligible.
    pub async fn send(&self, body: &[u8], delay: Duration) -> Result<Option<JobId>, JobError> {
        match self {
            Backend::Plain(q) => q.send(body, delay).await.map(Some),
            Backend::Dedup(q) => q.send(body).await,
        }
    }

    pub async fn receive(&self, visibility: Duration) -> Result<Option<Job>, JobError> {
        match self {
            Backend::Plain(q) => q.receive(visibility).await,
            Backend::Dedup(q) => q.receive(visibility.num_seconds()).await,
        }
    }

    pub async fn extend(&self, id: &str, delay: Duration) -> Result<(), JobError> {
        match self {
            Backend::Plain(q) => q.extend(id, delay).await,
            Backend::Dedup(q) => q.extend(id, delay.num_seconds()).await,
        }
    }

    /// Polls the backend's own `receive_and_wait` until a message shows up
    /// or `cancelled` fires.
    pub async fn receive_and_wait(
        &self,
        visibility: Duration,
        interval: std::time::Duration,
        cancelled: &CancellationToken,
    ) -> Result<Option<Job>, JobError> {
        match self {
            Backend::Plain(q) => q.receive_and_wait(visibility, interval, cancelled).await,
            Backend::Dedup(q) => {
                q.receive_and_wait(visibility.num_seconds(), interval, cancelled)
                    .await
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), JobError> {
        match self {
            Backend::Plain(q) => q.delete(id).await,
            Backend::Dedup(q) => q.delete(id).await,
        }
    }

    pub async fn move_to_dead_letter(
        &self,
        id: &str,
        job_name: &str,
        reason: DeadLetterReason,
        error_message: &str,
    ) -> Result<(), JobError> {
        match self {
            Backend::Plain(q) => q.move_to_dead_letter(id, job_name, reason, error_message).await,
            Backend::Dedup(q) => q.move_to_dead_letter(id, reason, error_message).await,
        }
    }
}

pub struct WorkerPool {
    backend: Backend,
    config: WorkerConfig,
    handlers: RwLock<HashMap<String, Arc<Registration>>>,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(backend: Backend, config: WorkerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.job_count_limit));
        Self {
            backend,
            config,
            handlers: RwLock::new(HashMap::new()),
            semaphore,
        }
    }

    pub async fn setup(&self) -> Result<(), QueueError> {
        self.backend.setup().await
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<(), JobError>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        self.register_with(name, handler, HandlerOptions::default())
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
        let name = name.into();
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&name) {
            return Err(JobError::DuplicateHandler(name));
        }
        let wrapped: Handler = Arc::new(move |body| handler(body).boxed());
        handlers.insert(name, Arc::new(Registration { handler: wrapped, options }));
        Ok(())
    }

    /// `trace: None` captures the calling task's active span context
    /// automatically (§4.6); pass `Some(..)` to propagate an explicit one
    /// instead.
    pub async fn enqueue(
        &self,
        task_name: &str,
        message: &[u8],
        trace: Option<TraceContext>,
        delay: Duration,
    ) -> Result<Option<JobId>, JobError> {
        let trace = trace.or_else(trace::capture);
        let envelope = Envelope::new(task_name, message, trace);
        self.backend.send(&envelope.encode(), delay).await
    }

    /// Same guarantee as `enqueue` -- a single-row insert is already
    /// atomic -- kept as a named, separate entry point per §4.4 for callers
    /// that want an explicit seam to later compose with other statements.
    pub async fn enqueue_tx(
        &self,
        task_name: &str,
        message: &[u8],
        trace: Option<TraceContext>,
        delay: Duration,
    ) -> Result<Option<JobId>, JobError> {
        self.enqueue(task_name, message, trace, delay).await
    }

    /// Runs the main claim loop until `cancel` fires. Each in-flight
    /// handler holds one semaphore permit; once `job_count_limit` are held
    /// the loop just sleeps a poll interval rather than claiming more work.
    pub async fn start(&self, cancel: CancellationToken) {
        let visibility = Duration::seconds(self.config.timeout_seconds as i64);
        let poll_interval = std::time::Duration::from_millis(self.config.poll_interval_millis);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            let job = loop {
                match self.backend.receive_and_wait(visibility, poll_interval, &cancel).await {
                    Ok(Some(job)) => break job,
                    Ok(None) => return,
                    Err(err) => {
                        tracing::error!(error = %err, "receive failed");
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => continue,
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
            };

            let envelope = match Envelope::decode(&job.body) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "invalid envelope, dead-lettering");
                    let _ = self
                        .backend
                        .move_to_dead_letter(&job.id, "unknown", DeadLetterReason::PermanentError, &err.to_string())
                        .await;
                    continue;
                }
            };

            let message = match envelope.message_bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "invalid envelope body, dead-lettering");
                    let _ = self
                        .backend
                        .move_to_dead_letter(&job.id, &envelope.name, DeadLetterReason::PermanentError, &err.to_string())
                        .await;
                    continue;
                }
            };

            let registration = {
                let handlers = self.handlers.read().unwrap();
                handlers.get(&envelope.name).cloned()
            };
            let Some(registration) = registration else {
                panic!(
                    "job {} names task \"{}\", which no handler is registered for",
                    job.id, envelope.name
                );
            };

            let backend = self.backend.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process_job(backend, config, registration, job, envelope.name, message, envelope.trace).await;
            });
        }
    }

    /// Waits up to `deadline` for every in-flight handler to finish by
    /// reclaiming all `job_count_limit` permits.
    pub async fn drain(&self, deadline: std::time::Duration) -> Result<(), QueueError> {
        match tokio::time::timeout(
            deadline,
            Arc::clone(&self.semaphore).acquire_many_owned(self.config.job_count_limit as u32),
        )
        .await
        {
            Ok(Ok(permit)) => {
                drop(permit);
                Ok(())
            }
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(QueueError::DrainTimeout),
        }
    }
}

#[tracing::instrument(skip(backend, config, registration, job, message, trace), fields(job_id = %job.id, task = %task_name, attempt = job.received))]
async fn process_job(
    backend: Backend,
    config: WorkerConfig,
    registration: Arc<Registration>,
    job: Job,
    task_name: String,
    message: Bytes,
    trace: Option<TraceContext>,
) {
    if let Some(ctx) = &trace {
        trace::install_link(&tracing::Span::current(), ctx);
    }

    let keepalive_cancel = CancellationToken::new();
    let keepalive = {
        let backend = backend.clone();
        let id = job.id.clone();
        let extend_delay = Duration::seconds(config.extend_delay_seconds as i64);
        let period = std::time::Duration::from_millis((config.extend_delay_seconds as f64 * 800.0) as u64);
        let cancel = keepalive_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        if let Err(err) = backend.extend(&id, extend_delay).await {
                            tracing::warn!(job_id = %id, error = %err, "lease extension failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    let handler = registration.handler.clone();
    let outcome = AssertUnwindSafe((handler)(message)).catch_unwind().await;
    keepalive_cancel.cancel();
    let _ = keepalive.await;

    match outcome {
        Ok(Ok(())) => {
            if let Err(err) = backend.delete(&job.id).await {
                tracing::error!(job_id = %job.id, error = %err, "failed to delete completed job");
            }
        }
        Ok(Err(err)) => handle_failure(&backend, &config, &registration, &job, &task_name, err.as_ref()).await,
        Err(panic) => {
            let message = panic_message(&panic);
            tracing::error!(job_id = %job.id, panic = %message, "handler panicked");
            let err = crate::error::PermanentError::message(message);
            handle_failure(&backend, &config, &registration, &job, &task_name, &err).await;
        }
    }
}

async fn handle_failure(
    backend: &Backend,
    config: &WorkerConfig,
    registration: &Registration,
    job: &Job,
    task_name: &str,
    err: &(dyn std::error::Error + Send + Sync + 'static),
) {
    if is_permanent(err) {
        if let Some(on_failure) = &registration.options.on_failure {
            on_failure(job, err);
        }
        if let Err(dlq_err) = backend
            .move_to_dead_letter(&job.id, task_name, DeadLetterReason::PermanentError, &err.to_string())
            .await
        {
            tracing::error!(job_id = %job.id, error = %dlq_err, "failed to move permanently-failed job to dead letter");
        }
        return;
    }

    if job.received >= config.max_retries as i32 {
        if let Some(on_failure) = &registration.options.on_failure {
            on_failure(job, err);
        }
        if let Err(dlq_err) = backend
            .move_to_dead_letter(&job.id, task_name, DeadLetterReason::MaxRetries, &err.to_string())
            .await
        {
            tracing::error!(job_id = %job.id, error = %dlq_err, "failed to move exhausted job to dead letter");
        }
        return;
    }

    tracing::warn!(job_id = %job.id, task = %task_name, attempt = job.received, error = %err, "handler failed, leaving for retry");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}
