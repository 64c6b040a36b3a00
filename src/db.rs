//! Shared connection handle: an `sqlx::Any` pool paired with the `Dialect`
//! it was opened against, so every storage op can rebind its SQL text
//! before executing. `Any` gives us one row/pool type across SQLite and
//! Postgres; the dialect adapter (`crate::dialect`) gives us one SQL
//! grammar.

use sqlx::any::Any;
use sqlx::Pool;

use crate::config::PoolConfig;
use crate::dialect::Dialect;
use crate::error::QueueError;

pub const SCHEMA_SQLITE: &str = include_str!("schema/sqlite.sql");
pub const SCHEMA_POSTGRES: &str = include_str!("schema/postgres.sql");

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Any>,
    pub dialect: Dialect,
}

impl Database {
    pub async fn connect(config: &PoolConfig) -> Result<Self, QueueError> {
        let dialect = config.dialect()?;
        let pool = config.connect().await?;
        Ok(Self { pool, dialect })
    }

    pub fn from_pool(pool: Pool<Any>, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    /// Runs the embedded, idempotent schema script for this dialect.
    /// Safe to call on every process start -- every statement is a
    /// `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS`.
    pub async fn setup(&self) -> Result<(), QueueError> {
        let script = match self.dialect {
            Dialect::Sqlite => SCHEMA_SQLITE,
            Dialect::Postgres => SCHEMA_POSTGRES,
        };
        sqlx::raw_sql(script)
            .execute(&self.pool)
            .await
            .map_err(QueueError::Setup)?;
        Ok(())
    }

    pub fn rebind(&self, sql: &str) -> String {
        self.dialect.rebind(sql)
    }
}

/// Current time as epoch milliseconds -- the unified timestamp
/// representation used by both schemas (see SPEC_FULL.md §6).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
