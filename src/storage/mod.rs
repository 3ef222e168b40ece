//! SQLite storage layer -- pool, schema, model persistence and engine state.

pub mod persist;
pub mod schema;
pub mod state;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::detect::DetectError;

pub use self::persist::SqlitePersistence;
pub use self::state::StateStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// An in-memory database behind a single-connection pool.
///
/// Every SQLite in-memory connection is its own database, so the pool must
/// never open a second one. Callers must not hold a connection while asking
/// for another.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder()
        .max_size(1)
        .max_lifetime(None)
        .idle_timeout(None)
        .build(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Run a synchronous storage closure on the blocking pool.
pub(crate) async fn blocking<T, F>(pool: &Pool, f: F) -> Result<T, DetectError>
where
    F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().context("failed to get database connection")?;
        f(&conn)
    })
    .await
    .map_err(DetectError::storage)?
    .map_err(|e| DetectError::Storage(format!("{e:#}")))
}

/// Fixed-width RFC 3339, so stored timestamps sort lexically.
pub(crate) fn to_sql_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored RFC 3339 timestamp inside a row-mapping closure.
pub(crate) fn from_sql_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_pool_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/anomalywatch.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM findings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(path.exists());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = from_sql_ts(0, &to_sql_ts(&now)).unwrap();
        assert_eq!(parsed, now);
    }
}
