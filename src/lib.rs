// Types
mod types;
pub use types::Bytes;
pub use types::DeadLetterReason;
pub use types::Envelope;
pub use types::Job;
pub use types::JobId;
pub use types::TraceContext;

// Errors
mod error;
// Errors about a specific job - bad ids, malformed envelopes, missing handlers.
pub use error::JobError;
// Errors about the queue itself - pool setup, transient database failures, config validation.
pub use error::QueueError;
pub use error::{is_permanent, PermanentError};

// Dialect adapter
mod dialect;
pub use dialect::Dialect;

// Shared connection handle + embedded schema
mod db;
pub use db::Database;

// Dedup key hashing
mod hash;
pub use hash::{sha256_hasher, KeyHasher};

// Trace propagation
mod trace;

// Config
mod config;
pub use config::DedupConfig;
pub use config::PoolConfig;
pub use config::ServiceConfig;
pub use config::WorkerConfig;

// Queue storage
mod dedup;
mod plain;
pub use dedup::DedupQueue;
pub use plain::PlainQueue;

// Worker pool
mod worker;
pub use worker::{Backend, Handler, HandlerOptions, OnFailure, WorkerPool};

// Service facade
mod service;
pub use service::Service;
