//! SQLite-backed baseline and sensitivity persistence.

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::baseline::{Baseline, ModelPersistence};
use crate::detect::DetectError;

use super::{blocking, to_sql_ts, Pool};

#[derive(Clone)]
pub struct SqlitePersistence {
    pool: Pool,
}

impl SqlitePersistence {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModelPersistence for SqlitePersistence {
    async fn persist_build(
        &self,
        entity_id: &str,
        baseline: &Baseline,
        sensitivity: Option<f64>,
    ) -> Result<(), DetectError> {
        let entity_id = entity_id.to_string();
        let json = serde_json::to_string(baseline).map_err(DetectError::storage)?;
        let kind = baseline.kind().to_string();
        let window = baseline.window();
        blocking(&self.pool, move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO baselines (entity_id, kind, model_json, window_start, window_end, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
                 ON CONFLICT(entity_id) DO UPDATE SET
                    kind = excluded.kind,
                    model_json = excluded.model_json,
                    window_start = excluded.window_start,
                    window_end = excluded.window_end,
                    updated_at = excluded.updated_at",
                params![
                    entity_id,
                    kind,
                    json,
                    to_sql_ts(&window.start),
                    to_sql_ts(&window.end)
                ],
            )
            .with_context(|| format!("failed to persist baseline for {entity_id}"))?;
            if let Some(value) = sensitivity {
                upsert_sensitivity(&tx, &entity_id, value)
                    .with_context(|| format!("failed to reset sensitivity for {entity_id}"))?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove_baseline(&self, entity_id: &str) -> Result<(), DetectError> {
        let entity_id = entity_id.to_string();
        blocking(&self.pool, move |conn| {
            conn.execute("DELETE FROM baselines WHERE entity_id = ?1", params![entity_id])?;
            Ok(())
        })
        .await
    }

    async fn load_baselines(&self) -> Result<Vec<(String, Baseline)>, DetectError> {
        blocking(&self.pool, |conn| {
            let mut stmt = conn.prepare("SELECT entity_id, model_json FROM baselines ORDER BY entity_id")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

            let mut out = Vec::new();
            for row in rows {
                let (entity_id, json) = row?;
                let baseline: Baseline = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt baseline record for {entity_id}"))?;
                out.push((entity_id, baseline));
            }
            Ok(out)
        })
        .await
    }

    async fn persist_sensitivity(&self, entity_id: &str, value: f64) -> Result<(), DetectError> {
        let entity_id = entity_id.to_string();
        blocking(&self.pool, move |conn| {
            upsert_sensitivity(conn, &entity_id, value)?;
            Ok(())
        })
        .await
    }

    async fn persist_false_alarm(
        &self,
        finding_id: Uuid,
        reason: Option<String>,
        entity_id: &str,
        sensitivity: f64,
    ) -> Result<bool, DetectError> {
        let entity_id = entity_id.to_string();
        blocking(&self.pool, move |conn| {
            let tx = conn.unchecked_transaction()?;
            let marked = tx.execute(
                "UPDATE findings SET false_positive = 1, false_alarm_reason = ?2
                 WHERE id = ?1 AND false_positive = 0",
                params![finding_id.to_string(), reason],
            )?;
            if marked == 0 {
                return Ok(false);
            }
            upsert_sensitivity(&tx, &entity_id, sensitivity)
                .with_context(|| format!("failed to lower sensitivity for {entity_id}"))?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn load_sensitivities(&self) -> Result<Vec<(String, f64)>, DetectError> {
        blocking(&self.pool, |conn| {
            let mut stmt = conn.prepare("SELECT entity_id, value FROM sensitivity ORDER BY entity_id")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

fn upsert_sensitivity(conn: &Connection, entity_id: &str, value: f64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sensitivity (entity_id, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(entity_id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![entity_id, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{BaselineWindow, NumericBaseline};
    use crate::detect::{Finding, FindingLog, Observation, Severity, Verdict};
    use crate::entity::EntityKind;
    use crate::scheduler::Tier;
    use crate::storage::open_memory_pool;
    use chrono::{TimeZone, Utc};

    fn numeric(mean: f64) -> Baseline {
        Baseline::Numeric(NumericBaseline {
            mean,
            std_dev: 0.1 + 0.2,
            sample_count: 42,
            window: BaselineWindow::ending_at(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(), 7),
        })
    }

    #[tokio::test]
    async fn test_baseline_round_trip_is_exact() {
        let persistence = SqlitePersistence::new(open_memory_pool().unwrap());
        let baseline = numeric(21.123456789012345);
        persistence.persist_build("sensor.t", &baseline, None).await.unwrap();
        persistence.persist_build("sensor.t", &numeric(5.0), None).await.unwrap();
        persistence.persist_build("sensor.u", &baseline, None).await.unwrap();

        let loaded = persistence.load_baselines().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], ("sensor.t".to_string(), numeric(5.0)));
        assert_eq!(loaded[1].1, baseline);
    }

    #[tokio::test]
    async fn test_remove_baseline() {
        let persistence = SqlitePersistence::new(open_memory_pool().unwrap());
        persistence.persist_build("sensor.t", &numeric(1.0), None).await.unwrap();
        persistence.remove_baseline("sensor.t").await.unwrap();
        assert!(persistence.load_baselines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sensitivity_upsert() {
        let persistence = SqlitePersistence::new(open_memory_pool().unwrap());
        persistence.persist_sensitivity("sensor.t", 0.9).await.unwrap();
        persistence.persist_sensitivity("sensor.t", 0.8).await.unwrap();
        assert_eq!(
            persistence.load_sensitivities().await.unwrap(),
            vec![("sensor.t".to_string(), 0.8)]
        );
    }

    #[tokio::test]
    async fn test_build_and_reset_commit_together() {
        let persistence = SqlitePersistence::new(open_memory_pool().unwrap());
        persistence.persist_sensitivity("sensor.t", 0.6).await.unwrap();

        // SQLite stores NaN as NULL, which the sensitivity column rejects.
        let err = persistence
            .persist_build("sensor.t", &numeric(1.0), Some(f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::Storage(_)));
        assert!(persistence.load_baselines().await.unwrap().is_empty());

        persistence.persist_build("sensor.t", &numeric(1.0), Some(1.0)).await.unwrap();
        assert_eq!(persistence.load_baselines().await.unwrap().len(), 1);
        assert_eq!(
            persistence.load_sensitivities().await.unwrap(),
            vec![("sensor.t".to_string(), 1.0)]
        );
    }

    #[tokio::test]
    async fn test_false_alarm_marks_and_lowers_once() {
        let pool = open_memory_pool().unwrap();
        let persistence = SqlitePersistence::new(pool.clone());
        let log = FindingLog::new(pool);
        let finding = Finding::new(
            "sensor.t",
            EntityKind::Numeric,
            Tier::Priority,
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Observation::Numeric(26.0),
            Verdict {
                severity: Severity::Medium,
                score: 3.0,
                baseline_summary: "mean=20.000 std_dev=2.000 n=10".to_string(),
            },
            false,
        );
        log.record(&finding).await.unwrap();

        // A failed sensitivity write leaves the finding unmarked for a retry.
        assert!(persistence
            .persist_false_alarm(finding.id, None, "sensor.t", f64::NAN)
            .await
            .is_err());
        assert!(!log.get(finding.id).await.unwrap().unwrap().false_positive);

        let marked = persistence
            .persist_false_alarm(finding.id, Some("window was open".to_string()), "sensor.t", 0.9)
            .await
            .unwrap();
        assert!(marked);
        let stored = log.get(finding.id).await.unwrap().unwrap();
        assert!(stored.false_positive);
        assert_eq!(stored.false_alarm_reason.as_deref(), Some("window was open"));

        let again = persistence
            .persist_false_alarm(finding.id, None, "sensor.t", 0.8)
            .await
            .unwrap();
        assert!(!again);
        assert_eq!(
            persistence.load_sensitivities().await.unwrap(),
            vec![("sensor.t".to_string(), 0.9)]
        );

        let unknown = persistence
            .persist_false_alarm(Uuid::new_v4(), None, "sensor.t", 0.5)
            .await
            .unwrap();
        assert!(!unknown);
    }
}
