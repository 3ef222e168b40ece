//! The baseline store: sole owner of per-entity models and sensitivity.
//!
//! Builds are atomic per entity. The new model is persisted before it is
//! swapped into memory, so a failed build or write leaves the previous
//! model in place everywhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::collector::SampleCollector;
use crate::detect::DetectError;
use crate::entity::EntityKind;

use super::{build_baseline, Baseline, BaselineWindow};

/// Storage seam for learned state.
#[async_trait]
pub trait ModelPersistence: Send + Sync {
    /// Store a new model, and the reset sensitivity when one is given, in a
    /// single write.
    async fn persist_build(
        &self,
        entity_id: &str,
        baseline: &Baseline,
        sensitivity: Option<f64>,
    ) -> Result<(), DetectError>;
    async fn remove_baseline(&self, entity_id: &str) -> Result<(), DetectError>;
    async fn load_baselines(&self) -> Result<Vec<(String, Baseline)>, DetectError>;
    async fn persist_sensitivity(&self, entity_id: &str, value: f64) -> Result<(), DetectError>;
    /// Mark a finding as a false positive and store the entity's lowered
    /// sensitivity in a single write. Returns false, writing nothing, if the
    /// finding was already marked.
    async fn persist_false_alarm(
        &self,
        finding_id: Uuid,
        reason: Option<String>,
        entity_id: &str,
        sensitivity: f64,
    ) -> Result<bool, DetectError>;
    async fn load_sensitivities(&self) -> Result<Vec<(String, f64)>, DetectError>;
}

/// When a rebuild puts an entity's sensitivity back to its initial value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityReset {
    Never,
    /// Only when the entity had no baseline (first build, after reclassify).
    #[default]
    OnColdRebuild,
    OnEveryRebuild,
}

pub struct BaselineStore {
    collector: Arc<SampleCollector>,
    persistence: Arc<dyn ModelPersistence>,
    models: RwLock<HashMap<String, Baseline>>,
    sensitivity: RwLock<HashMap<String, f64>>,
    initial_sensitivity: HashMap<String, f64>,
    reset: SensitivityReset,
    min_samples: usize,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BaselineStore {
    pub fn new(
        collector: Arc<SampleCollector>,
        persistence: Arc<dyn ModelPersistence>,
        min_samples: usize,
        reset: SensitivityReset,
        initial_sensitivity: HashMap<String, f64>,
    ) -> Self {
        Self {
            collector,
            persistence,
            models: RwLock::new(HashMap::new()),
            sensitivity: RwLock::new(HashMap::new()),
            initial_sensitivity,
            reset,
            min_samples,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Restore persisted models and sensitivities. Returns the number of
    /// baselines loaded.
    pub async fn load(&self) -> Result<usize, DetectError> {
        let baselines = self.persistence.load_baselines().await?;
        let sensitivities = self.persistence.load_sensitivities().await?;
        let count = baselines.len();

        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(baselines);
        self.sensitivity
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(sensitivities);

        info!(baselines = count, "loaded persisted baselines");
        Ok(count)
    }

    fn entity_lock(&self, entity_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(entity_id.to_string()).or_default().clone()
    }

    /// Build from history ending now (truncated to whole seconds).
    pub async fn build(
        &self,
        entity_id: &str,
        kind: EntityKind,
        window_days: u32,
    ) -> Result<Baseline, DetectError> {
        self.build_at(entity_id, kind, window_days, Utc::now().trunc_subsecs(0))
            .await
    }

    /// Build from the window of `window_days` ending at `anchor`. Identical
    /// history and anchor yield an identical model.
    pub async fn build_at(
        &self,
        entity_id: &str,
        kind: EntityKind,
        window_days: u32,
        anchor: DateTime<Utc>,
    ) -> Result<Baseline, DetectError> {
        let lock = self.entity_lock(entity_id);
        let _guard = lock.lock().await;

        let window = BaselineWindow::ending_at(anchor, window_days);
        let samples = self
            .collector
            .collect_history(entity_id, kind, window.start, window.end)
            .await?;
        let baseline = build_baseline(kind, samples, window, self.min_samples)?;

        let reset = match self.reset {
            SensitivityReset::Never => false,
            SensitivityReset::OnColdRebuild => self.get(entity_id).is_none(),
            SensitivityReset::OnEveryRebuild => true,
        };
        let reset_to = reset.then(|| self.initial_sensitivity(entity_id));
        self.persistence
            .persist_build(entity_id, &baseline, reset_to)
            .await?;

        if let Some(initial) = reset_to {
            self.sensitivity
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(entity_id.to_string(), initial);
        }

        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity_id.to_string(), baseline.clone());

        debug!(entity = %entity_id, %kind, samples = baseline.sample_count(), "baseline built");
        Ok(baseline)
    }

    pub fn get(&self, entity_id: &str) -> Option<Baseline> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_id)
            .cloned()
    }

    /// Drop the model; evaluation of this entity is skipped until rebuilt.
    pub async fn invalidate(&self, entity_id: &str) -> Result<(), DetectError> {
        let lock = self.entity_lock(entity_id);
        let _guard = lock.lock().await;

        self.persistence.remove_baseline(entity_id).await?;
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity_id);
        info!(entity = %entity_id, "baseline invalidated");
        Ok(())
    }

    fn initial_sensitivity(&self, entity_id: &str) -> f64 {
        self.initial_sensitivity.get(entity_id).copied().unwrap_or(1.0)
    }

    pub fn sensitivity(&self, entity_id: &str) -> f64 {
        self.sensitivity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_id)
            .copied()
            .unwrap_or_else(|| self.initial_sensitivity(entity_id))
    }

    /// Lower sensitivity by `step`, never below `floor`. Returns the new value.
    pub async fn nudge_sensitivity_down(
        &self,
        entity_id: &str,
        step: f64,
        floor: f64,
    ) -> Result<f64, DetectError> {
        let lock = self.entity_lock(entity_id);
        let _guard = lock.lock().await;

        let current = self.sensitivity(entity_id);
        let next = lowered(current, step, floor);
        if next == current {
            return Ok(current);
        }
        self.persistence.persist_sensitivity(entity_id, next).await?;
        self.sensitivity
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity_id.to_string(), next);

        info!(entity = %entity_id, from = current, to = next, "sensitivity lowered");
        Ok(next)
    }

    /// Lower sensitivity for a reported false alarm, marking the finding in
    /// the same write. `None` if the finding was already marked.
    pub async fn record_false_alarm(
        &self,
        entity_id: &str,
        finding_id: Uuid,
        reason: Option<String>,
        step: f64,
        floor: f64,
    ) -> Result<Option<f64>, DetectError> {
        let lock = self.entity_lock(entity_id);
        let _guard = lock.lock().await;

        let current = self.sensitivity(entity_id);
        let next = lowered(current, step, floor);
        let marked = self
            .persistence
            .persist_false_alarm(finding_id, reason, entity_id, next)
            .await?;
        if !marked {
            return Ok(None);
        }
        self.sensitivity
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity_id.to_string(), next);

        info!(entity = %entity_id, finding = %finding_id, from = current, to = next, "sensitivity lowered");
        Ok(Some(next))
    }

    /// All models, ordered by entity id.
    pub fn snapshot(&self) -> Vec<(String, Baseline)> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = models.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn lowered(current: f64, step: f64, floor: f64) -> f64 {
    (current - step).max(floor).min(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::storage::{open_memory_pool, SqlitePersistence};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap()
    }

    fn seeded_source() -> Arc<MemorySource> {
        let source = Arc::new(MemorySource::new());
        for i in 0..24 {
            let value = 20.0 + (i % 4) as f64 * 0.5;
            source.insert("sensor.t", value.to_string(), anchor() - Duration::hours(i + 1));
        }
        source
    }

    fn store_with(
        source: Arc<MemorySource>,
        persistence: Arc<dyn ModelPersistence>,
        reset: SensitivityReset,
    ) -> BaselineStore {
        let collector = Arc::new(SampleCollector::new(source, std::time::Duration::from_secs(1)));
        BaselineStore::new(collector, persistence, 5, reset, HashMap::new())
    }

    fn sqlite() -> Arc<dyn ModelPersistence> {
        Arc::new(SqlitePersistence::new(open_memory_pool().unwrap()))
    }

    /// Persistence whose writes can be made to fail. `failing` fails every
    /// model write; `failing_sensitivity` fails only writes that carry a
    /// sensitivity value.
    #[derive(Default)]
    struct FlakyPersistence {
        failing: AtomicBool,
        failing_sensitivity: AtomicBool,
    }

    impl FlakyPersistence {
        fn check(&self, flag: &AtomicBool) -> Result<(), DetectError> {
            if flag.load(Ordering::SeqCst) {
                return Err(DetectError::Storage("disk full".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ModelPersistence for FlakyPersistence {
        async fn persist_build(&self, _: &str, _: &Baseline, sensitivity: Option<f64>) -> Result<(), DetectError> {
            self.check(&self.failing)?;
            if sensitivity.is_some() {
                self.check(&self.failing_sensitivity)?;
            }
            Ok(())
        }
        async fn remove_baseline(&self, _: &str) -> Result<(), DetectError> {
            Ok(())
        }
        async fn load_baselines(&self) -> Result<Vec<(String, Baseline)>, DetectError> {
            Ok(Vec::new())
        }
        async fn persist_sensitivity(&self, _: &str, _: f64) -> Result<(), DetectError> {
            Ok(())
        }
        async fn persist_false_alarm(&self, _: Uuid, _: Option<String>, _: &str, _: f64) -> Result<bool, DetectError> {
            self.check(&self.failing_sensitivity)?;
            Ok(true)
        }
        async fn load_sensitivities(&self) -> Result<Vec<(String, f64)>, DetectError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_repeated_builds_are_identical() {
        let store = store_with(seeded_source(), sqlite(), SensitivityReset::default());
        let first = store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();
        let second = store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_insufficient_data_keeps_prior_model() {
        let source = seeded_source();
        let store = store_with(source.clone(), sqlite(), SensitivityReset::default());
        let prior = store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();

        // A window far in the future holds no samples.
        let err = store
            .build_at("sensor.t", EntityKind::Numeric, 1, anchor() + Duration::days(30))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::InsufficientData { have: 0, .. }));
        assert_eq!(store.get("sensor.t"), Some(prior));
    }

    #[tokio::test]
    async fn test_failed_persist_does_not_swap() {
        let flaky = Arc::new(FlakyPersistence::default());
        let store = store_with(seeded_source(), flaky.clone(), SensitivityReset::default());
        let prior = store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();

        flaky.failing.store(true, Ordering::SeqCst);
        let err = store
            .build_at("sensor.t", EntityKind::Numeric, 1, anchor())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::Storage(_)));
        assert_eq!(store.get("sensor.t"), Some(prior));
    }

    #[tokio::test]
    async fn test_failed_sensitivity_reset_leaves_entity_cold() {
        let flaky = Arc::new(FlakyPersistence::default());
        let store = store_with(seeded_source(), flaky.clone(), SensitivityReset::OnColdRebuild);
        store.nudge_sensitivity_down("sensor.t", 0.3, 0.2).await.unwrap();

        flaky.failing_sensitivity.store(true, Ordering::SeqCst);
        let err = store
            .build_at("sensor.t", EntityKind::Numeric, 7, anchor())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::Storage(_)));
        assert!(store.get("sensor.t").is_none());
        assert!((store.sensitivity("sensor.t") - 0.7).abs() < 1e-12);

        flaky.failing_sensitivity.store(false, Ordering::SeqCst);
        store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();
        assert!(store.get("sensor.t").is_some());
        assert_eq!(store.sensitivity("sensor.t"), 1.0);
    }

    #[tokio::test]
    async fn test_failed_false_alarm_write_keeps_sensitivity() {
        let flaky = Arc::new(FlakyPersistence::default());
        let store = store_with(seeded_source(), flaky.clone(), SensitivityReset::default());
        let finding = Uuid::new_v4();

        flaky.failing_sensitivity.store(true, Ordering::SeqCst);
        assert!(store.record_false_alarm("sensor.t", finding, None, 0.1, 0.2).await.is_err());
        assert_eq!(store.sensitivity("sensor.t"), 1.0);

        flaky.failing_sensitivity.store(false, Ordering::SeqCst);
        let lowered = store.record_false_alarm("sensor.t", finding, None, 0.1, 0.2).await.unwrap();
        assert_eq!(lowered, Some(0.9));
        assert_eq!(store.sensitivity("sensor.t"), 0.9);
    }

    #[tokio::test]
    async fn test_nudge_is_floored_and_isolated() {
        let store = store_with(seeded_source(), sqlite(), SensitivityReset::default());
        assert_eq!(store.sensitivity("sensor.t"), 1.0);

        let lowered = store.nudge_sensitivity_down("sensor.t", 0.5, 0.2).await.unwrap();
        assert_eq!(lowered, 0.5);
        let floored = store.nudge_sensitivity_down("sensor.t", 0.5, 0.2).await.unwrap();
        assert_eq!(floored, 0.2);
        let unchanged = store.nudge_sensitivity_down("sensor.t", 0.5, 0.2).await.unwrap();
        assert_eq!(unchanged, 0.2);

        assert_eq!(store.sensitivity("sensor.other"), 1.0);
    }

    #[tokio::test]
    async fn test_reset_policy_on_cold_rebuild() {
        let store = store_with(seeded_source(), sqlite(), SensitivityReset::OnColdRebuild);
        store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();
        store.nudge_sensitivity_down("sensor.t", 0.3, 0.2).await.unwrap();

        // Warm rebuild keeps the learned sensitivity.
        store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();
        assert!((store.sensitivity("sensor.t") - 0.7).abs() < 1e-12);

        // Cold rebuild resets it.
        store.invalidate("sensor.t").await.unwrap();
        assert!(store.get("sensor.t").is_none());
        store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();
        assert_eq!(store.sensitivity("sensor.t"), 1.0);
    }

    #[tokio::test]
    async fn test_reset_policy_never() {
        let store = store_with(seeded_source(), sqlite(), SensitivityReset::Never);
        store.nudge_sensitivity_down("sensor.t", 0.3, 0.2).await.unwrap();
        store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();
        assert!((store.sensitivity("sensor.t") - 0.7).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_load_restores_state() {
        let pool = open_memory_pool().unwrap();
        let persistence: Arc<dyn ModelPersistence> = Arc::new(SqlitePersistence::new(pool));
        let store = store_with(seeded_source(), persistence.clone(), SensitivityReset::default());
        let built = store.build_at("sensor.t", EntityKind::Numeric, 7, anchor()).await.unwrap();
        store.nudge_sensitivity_down("sensor.t", 0.1, 0.2).await.unwrap();

        let restored = store_with(seeded_source(), persistence, SensitivityReset::default());
        assert_eq!(restored.load().await.unwrap(), 1);
        assert_eq!(restored.get("sensor.t"), Some(built));
        assert!((restored.sensitivity("sensor.t") - 0.9).abs() < 1e-12);
    }
}
