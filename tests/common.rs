#![allow(dead_code)]

use jobqueue_core::{Database, PoolConfig};

/// A file-backed SQLite database in a fresh temp directory -- file-backed
/// rather than `:memory:` so the pool's multiple connections all see the
/// same data (an in-memory SQLite db is private per-connection unless
/// opened with a shared-cache URL, which `sqlx` doesn't expose through
/// `Any`).
pub struct TestDb {
    _dir: tempfile::TempDir,
    pub db: Database,
}

pub async fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("queue.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let config = PoolConfig::new(url);
    let db = Database::connect(&config).await.expect("connect to sqlite");
    db.setup().await.expect("run schema setup");
    TestDb { _dir: dir, db }
}
