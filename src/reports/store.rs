//! Bounded report history in SQLite.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::detect::DetectError;
use crate::storage::{blocking, from_sql_ts, to_sql_ts, Pool};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub id: i64,
    pub report: String,
    pub log_snippet: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReportStore {
    pool: Pool,
    max_reports: usize,
}

impl ReportStore {
    pub fn new(pool: Pool, max_reports: usize) -> Self {
        Self { pool, max_reports }
    }

    /// Save a report and prune the oldest beyond `max_reports`.
    pub async fn save(&self, report: &str, log_snippet: &str) -> Result<Report, DetectError> {
        let created_at = Utc::now();
        let (text, snippet) = (report.to_string(), log_snippet.to_string());
        let keep = self.max_reports.max(1) as i64;

        let id = blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO reports (report, log_snippet, created_at) VALUES (?1, ?2, ?3)",
                params![text, snippet, to_sql_ts(&created_at)],
            )?;
            let id = conn.last_insert_rowid();
            conn.execute(
                "DELETE FROM reports WHERE id NOT IN (
                    SELECT id FROM reports ORDER BY created_at DESC, id DESC LIMIT ?1
                 )",
                params![keep],
            )?;
            Ok(id)
        })
        .await?;

        Ok(Report {
            id,
            report: report.to_string(),
            log_snippet: log_snippet.to_string(),
            created_at,
        })
    }

    /// Newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<Report>, DetectError> {
        blocking(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, report, log_snippet, created_at FROM reports
                 ORDER BY created_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                let created: String = row.get(3)?;
                Ok(Report {
                    id: row.get(0)?,
                    report: row.get(1)?,
                    log_snippet: row.get(2)?,
                    created_at: from_sql_ts(3, &created)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
