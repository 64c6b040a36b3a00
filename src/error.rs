use thiserror::Error;

/// Errors about the queue itself: connection/pool setup, transient database
/// failures, schema setup, and validation of configuration handed to the
/// service facade.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("pool creation failed with: {0}")]
    PoolCreation(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("schema setup failed with: {0}")]
    Setup(sqlx::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("shutting down, not accepting new work")]
    Stopping,
    #[error("timed out waiting for worker drain")]
    DrainTimeout,
    #[error("service already started")]
    AlreadyStarted,
    #[error("service was never started")]
    NotStarted,
}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        QueueError::Query {
            command: "unknown".to_string(),
            error,
        }
    }
}

/// Errors about a specific job: bad ids, malformed envelopes, missing
/// handler registrations. These are programmer errors or producer mistakes,
/// as opposed to `QueueError`'s infrastructure failures.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("failed to decode message envelope: {0}")]
    EnvelopeDecode(String),
    #[error("envelope is missing name field")]
    MissingName,
    #[error("no handler registered for task {0}")]
    UnknownHandler(String),
    #[error("handler {0} already registered")]
    DuplicateHandler(String),
    #[error("delay must be non-negative, got {0}ms")]
    NegativeDelay(i64),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Marker wrapping any handler error that should skip retries and go
/// straight to the dead-letter table. Handlers return
/// `Err(PermanentError::wrap(err))` instead of a plain error to opt out of
/// the retry ladder; the worker pattern-matches on this via `is_permanent`.
#[derive(Error, Debug)]
#[error("permanent failure: {0}")]
pub struct PermanentError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

impl PermanentError {
    pub fn wrap<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        PermanentError(Box::new(err))
    }

    pub fn message(err: impl Into<String>) -> Self {
        #[derive(Error, Debug)]
        #[error("{0}")]
        struct Message(String);
        PermanentError(Box::new(Message(err.into())))
    }
}

/// Returns true if `err` (or one of its sources) is a `PermanentError`.
/// Handlers signal "skip the retry ladder, dead-letter immediately" by
/// wrapping their error in one; the worker walks the source chain looking
/// for it rather than requiring the top-level error type to match exactly.
pub fn is_permanent(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if e.downcast_ref::<PermanentError>().is_some() {
            return true;
        }
        cur = e.source();
    }
    false
}
