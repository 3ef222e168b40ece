//! Small pieces of engine state that must survive restarts: per-tier last
//! run times and a key/value table for flags such as the learning start.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::detect::DetectError;

use super::{blocking, from_sql_ts, to_sql_ts, Pool};

#[derive(Clone)]
pub struct StateStore {
    pool: Pool,
}

impl StateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn save_tier_run(
        &self,
        tier: &str,
        at: DateTime<Utc>,
        outcome: &str,
    ) -> Result<(), DetectError> {
        let (tier, outcome) = (tier.to_string(), outcome.to_string());
        blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO schedule_state (tier, last_run_at, last_outcome, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT(tier) DO UPDATE SET
                    last_run_at = excluded.last_run_at,
                    last_outcome = excluded.last_outcome,
                    updated_at = excluded.updated_at",
                params![tier, to_sql_ts(&at), outcome],
            )?;
            Ok(())
        })
        .await
    }

    /// Last successful run per tier name.
    pub async fn load_tier_runs(&self) -> Result<HashMap<String, DateTime<Utc>>, DetectError> {
        blocking(&self.pool, |conn| {
            let mut stmt = conn.prepare(
                "SELECT tier, last_run_at FROM schedule_state WHERE last_run_at IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                let raw: String = row.get(1)?;
                Ok((row.get::<_, String>(0)?, from_sql_ts(1, &raw)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, DetectError> {
        let key = key.to_string();
        blocking(&self.pool, move |conn| {
            Ok(conn
                .query_row("SELECT value FROM engine_state WHERE key = ?1", params![key], |row| row.get(0))
                .optional()?)
        })
        .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), DetectError> {
        let (key, value) = (key.to_string(), value.to_string());
        blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO engine_state (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), DetectError> {
        let key = key.to_string();
        blocking(&self.pool, move |conn| {
            conn.execute("DELETE FROM engine_state WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory_pool;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_tier_runs_persist() {
        let store = StateStore::new(open_memory_pool().unwrap());
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store.save_tier_run("baseline_refresh", at, "ok").await.unwrap();
        store
            .save_tier_run("baseline_refresh", at + chrono::Duration::days(1), "ok")
            .await
            .unwrap();

        let runs = store.load_tier_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs["baseline_refresh"], at + chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn test_key_value() {
        let store = StateStore::new(open_memory_pool().unwrap());
        assert_eq!(store.get("learning_started_at").await.unwrap(), None);
        store.set("learning_started_at", "x").await.unwrap();
        store.set("learning_started_at", "y").await.unwrap();
        assert_eq!(store.get("learning_started_at").await.unwrap().as_deref(), Some("y"));
        store.delete("learning_started_at").await.unwrap();
        assert_eq!(store.get("learning_started_at").await.unwrap(), None);
    }
}
