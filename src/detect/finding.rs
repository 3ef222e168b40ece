//! Append-only finding log in SQLite.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::scheduler::Tier;
use crate::storage::{blocking, from_sql_ts, to_sql_ts, Pool};

use super::{DetectError, Finding};

const COLUMNS: &str = "id, entity_id, kind, tier, severity, observed_json, score, baseline_summary, \
                       suppressed, false_positive, false_alarm_reason, observed_at";

#[derive(Clone)]
pub struct FindingLog {
    pool: Pool,
}

impl FindingLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, finding: &Finding) -> Result<(), DetectError> {
        let f = finding.clone();
        blocking(&self.pool, move |conn| {
            let observed = serde_json::to_string(&f.observed)?;
            conn.execute(
                "INSERT INTO findings (id, entity_id, kind, tier, severity, observed_json, score,
                    baseline_summary, suppressed, false_positive, false_alarm_reason, observed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, datetime('now'))",
                params![
                    f.id.to_string(),
                    f.entity_id,
                    f.kind.to_string(),
                    f.tier.to_string(),
                    f.severity.to_string(),
                    observed,
                    f.score,
                    f.baseline_summary,
                    f.suppressed,
                    f.false_positive,
                    f.false_alarm_reason,
                    to_sql_ts(&f.timestamp),
                ],
            )
            .with_context(|| format!("failed to record finding {}", f.id))?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Finding>, DetectError> {
        blocking(&self.pool, move |conn| {
            let sql = format!("SELECT {COLUMNS} FROM findings WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id.to_string()], map_finding)
                .optional()?)
        })
        .await
    }

    /// Newest observation time per (tier, entity), used to resume
    /// deduplication after a restart.
    pub async fn latest_per_entity(&self) -> Result<Vec<(Tier, String, DateTime<Utc>)>, DetectError> {
        blocking(&self.pool, |conn| {
            let mut stmt = conn.prepare(
                "SELECT tier, entity_id, MAX(observed_at) FROM findings GROUP BY tier, entity_id",
            )?;
            let rows = stmt.query_map([], |row| {
                let tier: String = row.get(0)?;
                let at: String = row.get(2)?;
                Ok((tier, row.get::<_, String>(1)?, from_sql_ts(2, &at)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (tier, entity_id, at) = row?;
                out.push((tier.parse()?, entity_id, at));
            }
            Ok(out)
        })
        .await
    }

    /// Most recent findings first, optionally for one entity.
    pub async fn list_recent(&self, limit: usize, entity_id: Option<&str>) -> Result<Vec<Finding>, DetectError> {
        let entity_id = entity_id.map(str::to_string);
        blocking(&self.pool, move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM findings
                 WHERE ?1 IS NULL OR entity_id = ?1
                 ORDER BY observed_at DESC, created_at DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![entity_id, limit as i64], map_finding)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

fn map_finding(row: &Row<'_>) -> rusqlite::Result<Finding> {
    fn conversion(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    }

    let id: String = row.get(0)?;
    let kind: String = row.get(2)?;
    let tier: String = row.get(3)?;
    let severity: String = row.get(4)?;
    let observed: String = row.get(5)?;
    let observed_at: String = row.get(11)?;

    Ok(Finding {
        id: Uuid::parse_str(&id).map_err(|e| conversion(0, e))?,
        entity_id: row.get(1)?,
        kind: kind.parse().map_err(|e| conversion(2, e))?,
        tier: tier.parse().map_err(|e| conversion(3, e))?,
        severity: severity.parse().map_err(|e| conversion(4, e))?,
        observed: serde_json::from_str(&observed).map_err(|e| conversion(5, e))?,
        score: row.get(6)?,
        baseline_summary: row.get(7)?,
        suppressed: row.get(8)?,
        false_positive: row.get(9)?,
        false_alarm_reason: row.get(10)?,
        timestamp: from_sql_ts(11, &observed_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Observation, Severity, Verdict};
    use crate::entity::EntityKind;
    use crate::scheduler::Tier;
    use crate::storage::open_memory_pool;
    use chrono::{Duration, TimeZone, Utc};

    fn finding(entity: &str, minutes: i64) -> Finding {
        Finding::new(
            entity,
            EntityKind::Numeric,
            Tier::Priority,
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes),
            Observation::Numeric(26.0),
            Verdict {
                severity: Severity::Medium,
                score: 3.0,
                baseline_summary: "mean=20.000 std_dev=2.000 n=10".to_string(),
            },
            false,
        )
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let log = FindingLog::new(open_memory_pool().unwrap());
        let f = finding("sensor.t", 0);
        log.record(&f).await.unwrap();
        assert_eq!(log.get(f.id).await.unwrap(), Some(f));
        assert_eq!(log.get(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_recent_orders_and_filters() {
        let log = FindingLog::new(open_memory_pool().unwrap());
        for (entity, minutes) in [("sensor.a", 0), ("sensor.b", 5), ("sensor.a", 10)] {
            log.record(&finding(entity, minutes)).await.unwrap();
        }

        let all = log.list_recent(10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp > all[1].timestamp);

        let only_a = log.list_recent(10, Some("sensor.a")).await.unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|f| f.entity_id == "sensor.a"));
        assert_eq!(log.list_recent(1, None).await.unwrap().len(), 1);

        let mut latest = log.latest_per_entity().await.unwrap();
        latest.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].1, "sensor.a");
        assert_eq!(latest[0].2, only_a[0].timestamp);
    }
}
