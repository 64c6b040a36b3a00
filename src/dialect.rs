//! The dialect adapter: a single internal SQL grammar written with `?`
//! positional placeholders, translated to whichever backend a pool was
//! opened against. Stateless — every operation is a pure string rewrite.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Inferred from the connection URL scheme, the same way `sqlx::Any`
    /// picks a driver.
    pub fn from_url(url: &str) -> Result<Self, crate::error::QueueError> {
        if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Dialect::Postgres)
        } else {
            Err(crate::error::QueueError::InvalidConfig(format!(
                "unrecognized database url scheme in {url}"
            )))
        }
    }

    /// Rewrites `?` placeholders into `$1, $2, ...` for Postgres. SQLite
    /// accepts `?` natively so this is a no-op there.
    pub fn rebind(&self, sql: &str) -> String {
        match self {
            Dialect::Sqlite => sql.to_string(),
            Dialect::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut n = 0usize;
                for c in sql.chars() {
                    if c == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }

    /// Builds an "insert, but silently do nothing on a conflict" statement.
    /// `columns` and `placeholders` are assumed already dialect-neutral
    /// (`?`-style); the placeholders are rebound for Postgres same as any
    /// other query.
    pub fn insert_ignore(&self, table: &str, columns: &[&str], placeholders: &[&str]) -> String {
        let cols = columns.join(", ");
        let vals = placeholders.join(", ");
        let sql = match self {
            Dialect::Sqlite => format!("INSERT OR IGNORE INTO {table} ({cols}) VALUES ({vals})"),
            Dialect::Postgres => {
                format!("INSERT INTO {table} ({cols}) VALUES ({vals}) ON CONFLICT DO NOTHING")
            }
        };
        self.rebind(&sql)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}
