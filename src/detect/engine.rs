//! The engine context: every piece of mutable detection state, shared by
//! the tier loops, the API and the CLI.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::baseline::{flip_rate, Baseline, BaselineStore, ModelPersistence};
use crate::collector::{SampleCollector, SampleValue};
use crate::config::Config;
use crate::entity::{Classifier, Entity, EntityKind, EntityRegistry, Origin, Priority};
use crate::feedback::FeedbackAdjuster;
use crate::reports::{self, ReportError, ReportOutcome, ReportStore, Summarizer};
use crate::scheduler::{Cadence, LearningGate, LearningStatus, LearningWindow, ScheduleBook, Tier};
use crate::sink::{DegradedStatus, FindingSink};
use crate::source::{EntityFilter, StateSource};
use crate::storage::{Pool, SqlitePersistence, StateStore};

use super::{evaluate, DetectError, Finding, FindingLog, Observation, ThresholdPolicy};

const KEY_MONITORING: &str = "monitoring_active";
const KEY_LEARNING: &str = "learning";
const KEY_LEARNING_ENTITIES: &str = "learning_entities";

/// Counts from one tier run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierReport {
    pub evaluated: usize,
    pub findings: usize,
    pub suppressed: usize,
    pub skipped: usize,
    pub degraded: usize,
    pub rebuilt: usize,
    pub pruned: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ReportOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TierReport {
    fn noted(note: &str) -> Self {
        Self {
            note: Some(note.to_string()),
            ..Self::default()
        }
    }

    fn outcome(&self) -> String {
        if let Some(note) = &self.note {
            return note.clone();
        }
        format!(
            "evaluated={} findings={} suppressed={} skipped={} degraded={} rebuilt={} pruned={}",
            self.evaluated, self.findings, self.suppressed, self.skipped, self.degraded, self.rebuilt, self.pruned
        )
    }
}

enum EntityOutcome {
    /// No baseline yet; the host was not asked.
    Cold,
    Skipped,
    Normal,
    Finding(Finding),
}

/// Whether the host answered for at least one entity during a pass. A pass
/// fails only when every entity that reached the host found it unavailable.
#[derive(Default)]
struct Reachability {
    answered: usize,
    unavailable: Option<DetectError>,
}

impl Reachability {
    fn answered(&mut self) {
        self.answered += 1;
    }

    fn unavailable(&mut self, error: DetectError) {
        self.unavailable = Some(error);
    }

    fn into_result<T>(self, value: T) -> Result<T, DetectError> {
        match self.unavailable {
            Some(e) if self.answered == 0 => Err(e),
            _ => Ok(value),
        }
    }
}

/// A learned model with the entity's current sensitivity.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineView {
    pub entity_id: String,
    pub sensitivity: f64,
    pub baseline: Option<Baseline>,
}

/// Shared handle to the detection engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    policy: ThresholdPolicy,
    recent_window: chrono::Duration,
    registry: Arc<EntityRegistry>,
    store: Arc<BaselineStore>,
    collector: Arc<SampleCollector>,
    classifier: Classifier,
    findings: FindingLog,
    feedback: FeedbackAdjuster,
    reports: ReportStore,
    summarizer: Option<Arc<dyn Summarizer>>,
    sink: Arc<dyn FindingSink>,
    learning: LearningGate,
    schedule: ScheduleBook,
    state: StateStore,
    monitoring_active: AtomicBool,
    last_seen: Mutex<HashMap<(Tier, String), DateTime<Utc>>>,
    cancel: CancellationToken,
}

fn to_chrono(d: std::time::Duration, name: &str) -> Result<chrono::Duration, DetectError> {
    chrono::Duration::from_std(d)
        .map_err(|_| DetectError::Configuration(format!("{name} is out of range")))
}

impl Engine {
    /// Build the engine and restore persisted state: baselines,
    /// sensitivities, tier run times, learning and monitoring flags.
    pub async fn open(
        config: Config,
        pool: Pool,
        source: Arc<dyn StateSource>,
        sink: Arc<dyn FindingSink>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Result<Self, DetectError> {
        config.validate()?;
        let policy = config.threshold_policy()?;

        let collector = Arc::new(SampleCollector::new(source, config.source.timeout));
        let classifier = Classifier::new(
            collector.clone(),
            config.baseline.max_categorical_labels,
            config.baseline.max_label_len,
            chrono::Duration::days(i64::from(config.baseline.window_days)),
        );
        let persistence: Arc<dyn ModelPersistence> = Arc::new(SqlitePersistence::new(pool.clone()));
        let store = Arc::new(BaselineStore::new(
            collector.clone(),
            persistence,
            config.baseline.min_samples,
            config.sensitivity.reset,
            config.sensitivity.entities.clone(),
        ));
        store.load().await?;

        let registry = Arc::new(EntityRegistry::open(pool.clone()).await?);
        let findings = FindingLog::new(pool.clone());
        let feedback = FeedbackAdjuster::new(
            findings.clone(),
            store.clone(),
            registry.clone(),
            config.sensitivity.false_alarm_step,
            config.sensitivity.floor,
        );
        let reports = ReportStore::new(pool.clone(), config.reports.max_reports);
        let state = StateStore::new(pool);

        let schedule = ScheduleBook::new(to_chrono(config.schedule.retry_backoff, "retry_backoff")?);
        schedule.register(
            Tier::Priority,
            Cadence::Every(to_chrono(config.schedule.priority_check_interval, "priority_check_interval")?),
        );
        schedule.register(
            Tier::Standard,
            Cadence::Every(to_chrono(config.schedule.standard_interval(), "standard_check_interval")?),
        );
        schedule.register(
            Tier::BaselineRefresh,
            Cadence::Every(to_chrono(config.schedule.baseline_refresh_interval, "baseline_refresh_interval")?),
        );
        if config.reports.enabled && summarizer.is_some() {
            schedule.register(Tier::Report, Cadence::cron(&config.reports.cron)?);
        }
        for (tier, last_run) in state.load_tier_runs().await? {
            match tier.parse::<Tier>() {
                Ok(tier) => schedule.restore(tier, last_run),
                Err(e) => warn!(%tier, error = %e, "ignoring stored schedule state"),
            }
        }

        let last_seen = findings
            .latest_per_entity()
            .await?
            .into_iter()
            .map(|(tier, entity, at)| ((tier, entity), at))
            .collect();

        let monitoring_active = state.get(KEY_MONITORING).await?.map_or(true, |v| v != "false");

        let engine = Self {
            inner: Arc::new(EngineInner {
                recent_window: to_chrono(config.baseline.recent_window, "recent_window")?,
                config,
                policy,
                registry,
                store,
                collector,
                classifier,
                findings,
                feedback,
                reports,
                summarizer,
                sink,
                learning: LearningGate::new(),
                schedule,
                state,
                monitoring_active: AtomicBool::new(monitoring_active),
                last_seen: Mutex::new(last_seen),
                cancel: CancellationToken::new(),
            }),
        };
        engine.restore_learning().await?;
        Ok(engine)
    }

    async fn restore_learning(&self) -> Result<(), DetectError> {
        let inner = &self.inner;
        let window: Option<LearningWindow> = match inner.state.get(KEY_LEARNING).await? {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(DetectError::storage)?),
            None => None,
        };
        let mut entities: BTreeSet<String> = match inner.state.get(KEY_LEARNING_ENTITIES).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(DetectError::storage)?,
            None => BTreeSet::new(),
        };
        entities.extend(inner.config.learning.entities.iter().cloned());
        inner.learning.restore(window, entities);

        if window.is_none() && inner.config.learning.enabled {
            let started = inner
                .learning
                .start(Utc::now().trunc_subsecs(0), inner.config.learning.duration_days);
            self.persist_learning(&started).await?;
            info!(expires_at = ?started.expires_at, "learning mode started");
        }
        Ok(())
    }

    async fn persist_learning(&self, window: &LearningWindow) -> Result<(), DetectError> {
        let json = serde_json::to_string(window).map_err(DetectError::storage)?;
        self.inner.state.set(KEY_LEARNING, &json).await
    }

    // -- accessors -----------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &BaselineStore {
        &self.inner.store
    }

    pub fn findings(&self) -> &FindingLog {
        &self.inner.findings
    }

    pub fn feedback(&self) -> &FeedbackAdjuster {
        &self.inner.feedback
    }

    pub fn reports(&self) -> &ReportStore {
        &self.inner.reports
    }

    pub fn schedule(&self) -> &ScheduleBook {
        &self.inner.schedule
    }

    pub fn learning(&self) -> &LearningGate {
        &self.inner.learning
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Ask every tier loop to stop after the entity it is working on.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_monitoring_active(&self) -> bool {
        self.inner.monitoring_active.load(Ordering::SeqCst)
    }

    pub fn baseline(&self, entity_id: &str) -> Result<BaselineView, DetectError> {
        if self.inner.registry.get(entity_id).is_none() {
            return Err(DetectError::UnknownEntity(entity_id.to_string()));
        }
        Ok(BaselineView {
            entity_id: entity_id.to_string(),
            sensitivity: self.inner.store.sensitivity(entity_id),
            baseline: self.inner.store.get(entity_id),
        })
    }

    pub async fn classify(&self, entity_id: &str) -> Result<EntityKind, DetectError> {
        self.inner.classifier.classify(entity_id).await
    }

    // -- entity management ---------------------------------------------------

    /// Register every configured entity that is not yet in the registry and
    /// not ignored. Returns the number added. Configured priority wins over
    /// a stored one.
    pub async fn sync_configured(&self) -> Result<usize, DetectError> {
        let monitored = &self.inner.config.monitored;
        let configured = monitored
            .priority
            .iter()
            .map(|id| (id, Priority::High))
            .chain(
                monitored
                    .standard
                    .iter()
                    .filter(|id| !monitored.priority.contains(id))
                    .map(|id| (id, Priority::Standard)),
            );

        let mut added = 0;
        let mut reach = Reachability::default();
        for (id, priority) in configured {
            if self.inner.registry.is_ignored(id) {
                continue;
            }
            if let Some(existing) = self.inner.registry.get(id) {
                if existing.priority != priority && existing.origin == Origin::Configured {
                    self.inner.registry.upsert(Entity { priority, ..existing }).await?;
                }
                continue;
            }
            match self.register(id, priority, Origin::Configured).await {
                Ok(_) => {
                    added += 1;
                    reach.answered();
                }
                Err(e @ DetectError::SourceUnavailable(_)) => {
                    warn!(entity = %id, error = %e, "configured entity not reachable, will retry");
                    reach.unavailable(e);
                }
                Err(e) => {
                    warn!(entity = %id, error = %e, "configured entity not registered");
                    reach.answered();
                }
            }
        }
        if added > 0 {
            info!(added, "registered configured entities");
        }
        reach.into_result(added)
    }

    async fn register(&self, id: &str, priority: Priority, origin: Origin) -> Result<Entity, DetectError> {
        let entity = match self.inner.classifier.classify(id).await {
            Ok(kind) => Entity::new(id, kind, priority, origin),
            Err(DetectError::UnsuitableEntity { reason, .. }) => {
                warn!(entity = %id, %reason, "entity cannot be modeled");
                Entity {
                    unsuitable: Some(reason),
                    ..Entity::new(id, EntityKind::Categorical, priority, origin)
                }
            }
            Err(e) => return Err(e),
        };
        self.inner.registry.upsert(entity.clone()).await?;
        info!(entity = %id, kind = %entity.kind, %priority, "entity registered");

        if entity.is_modelable() {
            self.try_build(&entity).await?;
        }
        Ok(entity)
    }

    /// First build for a new or reclassified entity. Too little history is
    /// expected here and leaves the baseline cold.
    async fn try_build(&self, entity: &Entity) -> Result<(), DetectError> {
        let window_days = self.inner.config.baseline.window_days;
        match self.inner.store.build(&entity.id, entity.kind, window_days).await {
            Ok(_) => Ok(()),
            Err(DetectError::InsufficientData { needed, have }) => {
                debug!(entity = %entity.id, needed, have, "baseline stays cold until more history exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Start monitoring an entity chosen by the operator. An entity that is
    /// already registered only has its priority updated.
    pub async fn add_entity(&self, entity_id: &str, priority: Priority) -> Result<Entity, DetectError> {
        if let Some(existing) = self.inner.registry.get(entity_id) {
            let updated = Entity { priority, ..existing };
            self.inner.registry.upsert(updated.clone()).await?;
            return Ok(updated);
        }
        self.register(entity_id, priority, Origin::User).await
    }

    pub async fn remove_entity(&self, entity_id: &str) -> Result<Entity, DetectError> {
        let removed = self
            .inner
            .registry
            .remove(entity_id)
            .await?
            .ok_or_else(|| DetectError::UnknownEntity(entity_id.to_string()))?;
        self.forget(entity_id).await?;
        info!(entity = %entity_id, "entity removed");
        Ok(removed)
    }

    /// Remove an entity and keep configuration from adding it back.
    pub async fn ignore_entity(&self, entity_id: &str) -> Result<(), DetectError> {
        self.inner.registry.ignore(entity_id).await?;
        self.forget(entity_id).await?;
        info!(entity = %entity_id, "entity ignored");
        Ok(())
    }

    async fn forget(&self, entity_id: &str) -> Result<(), DetectError> {
        self.inner.store.invalidate(entity_id).await?;
        self.inner
            .last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(_, id), _| id != entity_id);
        Ok(())
    }

    /// Classify again from scratch. The baseline is always invalidated and
    /// rebuilt for the new kind.
    pub async fn reclassify(&self, entity_id: &str) -> Result<Entity, DetectError> {
        if self.inner.registry.get(entity_id).is_none() {
            return Err(DetectError::UnknownEntity(entity_id.to_string()));
        }
        let outcome = self.inner.classifier.classify(entity_id).await;
        self.forget(entity_id).await?;

        let entity = match outcome {
            Ok(kind) => {
                let entity = self.inner.registry.set_kind(entity_id, kind).await?;
                self.try_build(&entity).await?;
                entity
            }
            Err(DetectError::UnsuitableEntity { reason, .. }) => {
                self.inner.registry.set_unsuitable(entity_id, Some(reason)).await?
            }
            Err(e) => return Err(e),
        };
        info!(entity = %entity_id, kind = %entity.kind, modelable = entity.is_modelable(), "entity reclassified");
        Ok(entity)
    }

    // -- global switches -----------------------------------------------------

    /// Global kill switch for evaluation tiers.
    pub async fn set_global_monitoring(&self, enabled: bool) -> Result<(), DetectError> {
        self.inner
            .state
            .set(KEY_MONITORING, if enabled { "true" } else { "false" })
            .await?;
        self.inner.monitoring_active.store(enabled, Ordering::SeqCst);
        info!(enabled, "global monitoring toggled");
        Ok(())
    }

    pub async fn set_learning(&self, enabled: bool) -> Result<LearningStatus, DetectError> {
        let learning = &self.inner.learning;
        if enabled {
            let window = learning.start(Utc::now().trunc_subsecs(0), self.inner.config.learning.duration_days);
            self.persist_learning(&window).await?;
        } else if let Some(window) = learning.stop() {
            self.persist_learning(&window).await?;
        }
        info!(enabled, "learning mode toggled");
        Ok(learning.status())
    }

    pub async fn set_entity_learning(&self, entity_id: &str, enabled: bool) -> Result<LearningStatus, DetectError> {
        let learning = &self.inner.learning;
        if learning.set_entity(entity_id, enabled) {
            let json = serde_json::to_string(&learning.status().entities).map_err(DetectError::storage)?;
            self.inner.state.set(KEY_LEARNING_ENTITIES, &json).await?;
        }
        Ok(learning.status())
    }

    // -- tiers ---------------------------------------------------------------

    /// Run one tier now. Refused with `TierBusy` while the same tier runs.
    pub async fn run_tier(&self, tier: Tier) -> Result<TierReport, DetectError> {
        let inner = &self.inner;
        let _running = inner.schedule.begin(tier)?;
        debug!(%tier, "tier run started");

        let result = match tier {
            Tier::Standard | Tier::Priority => self.evaluation_pass(tier).await,
            Tier::BaselineRefresh => self.refresh_pass().await,
            Tier::Report => self.report_pass().await,
        };

        let finished = Utc::now();
        let (succeeded, outcome) = match &result {
            Ok(report) => (true, report.outcome()),
            Err(e) => (false, e.to_string()),
        };
        inner.schedule.finish(tier, finished, succeeded, outcome.clone());
        if let Err(e) = inner.state.save_tier_run(tier.as_str(), finished, &outcome).await {
            warn!(%tier, error = %e, "failed to persist schedule state");
        }
        result
    }

    /// Evaluate every enabled entity of the tier's priority, one at a time.
    /// Per-entity errors are reported as degraded and the pass moves on; the
    /// pass fails only if the host was unavailable for every entity it asked.
    async fn evaluation_pass(&self, tier: Tier) -> Result<TierReport, DetectError> {
        if !self.is_monitoring_active() {
            return Ok(TierReport::noted("monitoring disabled"));
        }
        let priority = match tier {
            Tier::Priority => Priority::High,
            _ => Priority::Standard,
        };

        let now = Utc::now();
        let mut report = TierReport::default();
        let mut reach = Reachability::default();
        for entity in self.inner.registry.for_priority(priority) {
            if self.inner.cancel.is_cancelled() {
                debug!(%tier, "cancelled, stopping pass");
                break;
            }
            match self.evaluate_entity(&entity, tier, now).await {
                Ok(EntityOutcome::Cold) => report.skipped += 1,
                Ok(EntityOutcome::Skipped) => {
                    report.skipped += 1;
                    reach.answered();
                }
                Ok(EntityOutcome::Normal) => {
                    report.evaluated += 1;
                    reach.answered();
                }
                Ok(EntityOutcome::Finding(f)) => {
                    report.evaluated += 1;
                    if f.suppressed {
                        report.suppressed += 1;
                    } else {
                        report.findings += 1;
                    }
                    reach.answered();
                }
                Err(e @ DetectError::SourceUnavailable(_)) => {
                    report.degraded += 1;
                    self.degrade(&entity.id, tier, &e).await;
                    reach.unavailable(e);
                }
                Err(e) => {
                    report.degraded += 1;
                    self.degrade(&entity.id, tier, &e).await;
                    reach.answered();
                }
            }
        }
        reach.into_result(report)
    }

    async fn evaluate_entity(&self, entity: &Entity, tier: Tier, now: DateTime<Utc>) -> Result<EntityOutcome, DetectError> {
        let inner = &self.inner;
        let Some(baseline) = inner.store.get(&entity.id) else {
            debug!(entity = %entity.id, "cold baseline, skipping");
            return Ok(EntityOutcome::Cold);
        };

        let (observation, observed_at) = match entity.kind {
            EntityKind::Binary => {
                let recent = inner
                    .collector
                    .collect_recent(&entity.id, EntityKind::Binary, inner.recent_window, now)
                    .await?;
                let Some(last) = recent.last().map(|s| s.timestamp) else {
                    return Ok(EntityOutcome::Skipped);
                };
                (Observation::FlipRate(flip_rate(&recent, inner.recent_window)), last)
            }
            kind => {
                let Some(sample) = inner.collector.collect_latest(&entity.id, kind).await? else {
                    debug!(entity = %entity.id, "no readable current value");
                    return Ok(EntityOutcome::Skipped);
                };
                let observation = match sample.value {
                    SampleValue::Numeric(x) => Observation::Numeric(x),
                    SampleValue::Categorical(label) => Observation::Label(label),
                    SampleValue::Binary(_) => return Ok(EntityOutcome::Skipped),
                };
                (observation, sample.timestamp)
            }
        };

        let key = (tier, entity.id.clone());
        {
            let last_seen = inner.last_seen.lock().unwrap_or_else(|e| e.into_inner());
            if last_seen.get(&key).is_some_and(|seen| observed_at <= *seen) {
                return Ok(EntityOutcome::Skipped);
            }
        }

        let verdict = evaluate(
            &observation,
            Some(&baseline),
            inner.policy.for_entity(&entity.id),
            inner.store.sensitivity(&entity.id),
            inner.policy.breakpoints(),
        );
        let outcome = match verdict {
            None => EntityOutcome::Normal,
            Some(verdict) => {
                let suppressed = inner.learning.is_learning(&entity.id, now);
                let finding = Finding::new(&entity.id, entity.kind, tier, observed_at, observation, verdict, suppressed);
                inner.findings.record(&finding).await?;
                if suppressed {
                    debug!(entity = %entity.id, severity = %finding.severity, "finding suppressed by learning mode");
                } else if let Err(e) = inner.sink.emit_finding(&finding).await {
                    warn!(entity = %entity.id, channel = inner.sink.name(), error = %e, "finding delivery failed");
                }
                EntityOutcome::Finding(finding)
            }
        };

        inner
            .last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, observed_at);
        Ok(outcome)
    }

    async fn degrade(&self, entity_id: &str, tier: Tier, error: &DetectError) {
        let status = DegradedStatus::new(entity_id, tier, error, Utc::now());
        if let Err(e) = self.inner.sink.emit_degraded(&status).await {
            warn!(entity = %entity_id, %tier, error = %e, "degraded-status delivery failed");
        }
    }

    /// Expire learning, prune entities the host dropped, register missing
    /// configured entities, then rebuild every enabled baseline against one
    /// shared anchor.
    async fn refresh_pass(&self) -> Result<TierReport, DetectError> {
        let inner = &self.inner;
        let tier = Tier::BaselineRefresh;
        let anchor = Utc::now().trunc_subsecs(0);
        let mut report = TierReport::default();
        let mut reach = Reachability::default();

        if let Some(closed) = inner.learning.expire_if_due(anchor) {
            self.persist_learning(&closed).await?;
            info!(started_at = %closed.started_at, "learning mode finished");
        }

        if inner.config.monitored.prune_missing {
            let present = inner.collector.list_entities(&EntityFilter::all()).await?;
            reach.answered();
            if present.is_empty() {
                warn!("host listed no entities, skipping prune");
            } else {
                for id in inner.registry.prune_missing(&present).await? {
                    self.forget(&id).await?;
                    report.pruned += 1;
                }
            }
        }

        match self.sync_configured().await {
            Ok(_) => {}
            Err(e @ DetectError::SourceUnavailable(_)) => reach.unavailable(e),
            Err(e) => return Err(e),
        }

        let window_days = inner.config.baseline.window_days;
        for entity in inner.registry.all() {
            if inner.cancel.is_cancelled() {
                break;
            }
            if !entity.enabled || !entity.is_modelable() {
                report.skipped += 1;
                continue;
            }
            match inner.store.build_at(&entity.id, entity.kind, window_days, anchor).await {
                Ok(_) => {
                    report.rebuilt += 1;
                    reach.answered();
                }
                Err(e @ DetectError::SourceUnavailable(_)) => {
                    report.degraded += 1;
                    self.degrade(&entity.id, tier, &e).await;
                    reach.unavailable(e);
                }
                Err(e) => {
                    report.degraded += 1;
                    self.degrade(&entity.id, tier, &e).await;
                    reach.answered();
                }
            }
        }
        reach.into_result(report)
    }

    async fn report_pass(&self) -> Result<TierReport, DetectError> {
        let inner = &self.inner;
        let Some(summarizer) = inner.summarizer.as_deref() else {
            return Err(DetectError::Configuration("no summarizer configured".to_string()));
        };
        let cfg = &inner.config.reports;
        let outcome = reports::generate_report(&cfg.log_path, &cfg.levels, summarizer, &inner.reports)
            .await
            .map_err(|e| match e {
                ReportError::Storage(e) => e,
                other => DetectError::SourceUnavailable(other.to_string()),
            })?;
        Ok(TierReport {
            report: Some(outcome),
            ..TierReport::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use crate::source::{MemorySource, RawState, SourceError};
    use crate::storage::open_memory_pool;
    use async_trait::async_trait;
    use chrono::Duration;

    /// Memory host where one entity can be made to time out.
    struct SlowEntity {
        inner: Arc<MemorySource>,
        id: &'static str,
        slow: AtomicBool,
    }

    impl SlowEntity {
        fn check(&self, entity_id: &str) -> Result<(), SourceError> {
            if entity_id == self.id && self.slow.load(Ordering::SeqCst) {
                return Err(SourceError::Unavailable("timeout".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StateSource for SlowEntity {
        async fn current_state(&self, entity_id: &str) -> Result<RawState, SourceError> {
            self.check(entity_id)?;
            self.inner.current_state(entity_id).await
        }

        async fn history(
            &self,
            entity_id: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<RawState>, SourceError> {
            self.check(entity_id)?;
            self.inner.history(entity_id, from, to).await
        }

        async fn list_entities(&self, filter: &EntityFilter) -> Result<BTreeSet<String>, SourceError> {
            self.inner.list_entities(filter).await
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        findings: Mutex<Vec<Finding>>,
        degraded: Mutex<Vec<DegradedStatus>>,
    }

    #[async_trait]
    impl FindingSink for RecordingSink {
        async fn emit_finding(&self, finding: &Finding) -> Result<(), SinkError> {
            self.findings.lock().unwrap().push(finding.clone());
            Ok(())
        }
        async fn emit_degraded(&self, status: &DegradedStatus) -> Result<(), SinkError> {
            self.degraded.lock().unwrap().push(status.clone());
            Ok(())
        }
        fn name(&self) -> &str {
            "recording"
        }
    }

    /// Twelve hours of readings around 20.0, plus a current value.
    fn seed_numeric(source: &MemorySource, id: &str, current: f64, at: DateTime<Utc>) {
        for h in 1..=12 {
            let value = if h % 2 == 0 { 19.0 } else { 21.0 };
            source.insert(id, value.to_string(), at - Duration::hours(h));
        }
        source.insert(id, current.to_string(), at);
    }

    async fn engine_with(config: Config, source: Arc<MemorySource>) -> (Engine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let engine = Engine::open(config, open_memory_pool().unwrap(), source, sink.clone(), None)
            .await
            .unwrap();
        (engine, sink)
    }

    #[tokio::test]
    async fn test_priority_pass_emits_and_dedupes() {
        let now = Utc::now().trunc_subsecs(0) - Duration::minutes(1);
        let source = Arc::new(MemorySource::new());
        seed_numeric(&source, "sensor.boiler", 30.0, now);

        let mut config = Config::default();
        config.monitored.priority = vec!["sensor.boiler".to_string()];
        let (engine, sink) = engine_with(config, source).await;

        engine.sync_configured().await.unwrap();
        assert!(engine.store().get("sensor.boiler").is_some());

        let first = engine.run_tier(Tier::Priority).await.unwrap();
        assert_eq!(first.findings, 1);
        assert_eq!(sink.findings.lock().unwrap()[0].entity_id, "sensor.boiler");

        // Nothing new from the host: the same sample is not evaluated twice.
        let second = engine.run_tier(Tier::Priority).await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(sink.findings.lock().unwrap().len(), 1);

        // Standard tier has no entities.
        let standard = engine.run_tier(Tier::Standard).await.unwrap();
        assert_eq!(standard.evaluated + standard.skipped, 0);
    }

    #[tokio::test]
    async fn test_disabled_monitoring_skips_evaluation() {
        let now = Utc::now().trunc_subsecs(0) - Duration::minutes(1);
        let source = Arc::new(MemorySource::new());
        seed_numeric(&source, "sensor.t", 30.0, now);
        let mut config = Config::default();
        config.monitored.standard = vec!["sensor.t".to_string()];
        let (engine, sink) = engine_with(config, source).await;
        engine.sync_configured().await.unwrap();

        engine.set_global_monitoring(false).await.unwrap();
        let report = engine.run_tier(Tier::Standard).await.unwrap();
        assert_eq!(report.note.as_deref(), Some("monitoring disabled"));

        engine.set_global_monitoring(true).await.unwrap();
        engine.feedback().report_monitoring_toggle("sensor.t", false).await.unwrap();
        let report = engine.run_tier(Tier::Standard).await.unwrap();
        assert_eq!(report.evaluated, 0);
        assert!(sink.findings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_source_fails_tier_and_backs_off() {
        let now = Utc::now().trunc_subsecs(0) - Duration::minutes(1);
        let source = Arc::new(MemorySource::new());
        seed_numeric(&source, "sensor.t", 20.0, now);
        let mut config = Config::default();
        config.monitored.standard = vec!["sensor.t".to_string()];
        let (engine, _sink) = engine_with(config, source.clone()).await;
        engine.sync_configured().await.unwrap();

        source.set_offline(true);
        let err = engine.run_tier(Tier::Standard).await.unwrap_err();
        assert!(matches!(err, DetectError::SourceUnavailable(_)));

        let status = engine
            .schedule()
            .snapshot(Utc::now())
            .into_iter()
            .find(|s| s.tier == Tier::Standard)
            .unwrap();
        assert_eq!(status.consecutive_failures, 1);
        let last = status.last_run.unwrap();
        assert_eq!(status.next_due, last + Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_one_slow_entity_does_not_stop_the_tier() {
        let now = Utc::now().trunc_subsecs(0) - Duration::minutes(1);
        let memory = Arc::new(MemorySource::new());
        seed_numeric(&memory, "sensor.a", 20.0, now);
        seed_numeric(&memory, "sensor.b", 40.0, now);
        let source = Arc::new(SlowEntity {
            inner: memory,
            id: "sensor.a",
            slow: AtomicBool::new(false),
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = Engine::open(Config::default(), open_memory_pool().unwrap(), source.clone(), sink.clone(), None)
            .await
            .unwrap();
        engine.add_entity("sensor.a", Priority::High).await.unwrap();
        engine.add_entity("sensor.b", Priority::High).await.unwrap();
        let model_a = engine.store().get("sensor.a").unwrap();

        source.slow.store(true, Ordering::SeqCst);
        let report = engine.run_tier(Tier::Priority).await.unwrap();
        assert_eq!(report.degraded, 1);
        assert_eq!(report.findings, 1);
        assert_eq!(sink.findings.lock().unwrap()[0].entity_id, "sensor.b");
        {
            let degraded = sink.degraded.lock().unwrap();
            assert_eq!(degraded[0].entity_id, "sensor.a");
            assert_eq!(degraded[0].error_kind, "source_unavailable");
        }

        let refresh = engine.run_tier(Tier::BaselineRefresh).await.unwrap();
        assert_eq!(refresh.rebuilt, 1);
        assert_eq!(refresh.degraded, 1);
        assert_eq!(engine.store().get("sensor.a"), Some(model_a));
    }

    #[tokio::test]
    async fn test_insufficient_history_is_degraded_on_refresh() {
        let now = Utc::now().trunc_subsecs(0) - Duration::minutes(1);
        let source = Arc::new(MemorySource::new());
        source.insert("sensor.new", "1.0", now);
        let mut config = Config::default();
        config.monitored.standard = vec!["sensor.new".to_string()];
        let (engine, sink) = engine_with(config, source).await;

        let report = engine.run_tier(Tier::BaselineRefresh).await.unwrap();
        assert_eq!(report.degraded, 1);
        assert!(engine.store().get("sensor.new").is_none());
        assert_eq!(sink.degraded.lock().unwrap()[0].error_kind, "insufficient_data");
    }

    #[tokio::test]
    async fn test_refresh_prunes_entities_host_dropped() {
        let now = Utc::now().trunc_subsecs(0) - Duration::minutes(1);
        let source = Arc::new(MemorySource::new());
        seed_numeric(&source, "sensor.a", 20.0, now);
        seed_numeric(&source, "sensor.b", 20.0, now);
        let (engine, _sink) = engine_with(Config::default(), source.clone()).await;
        engine.add_entity("sensor.a", Priority::Standard).await.unwrap();
        engine.add_entity("sensor.b", Priority::Standard).await.unwrap();

        source.remove("sensor.b");
        let report = engine.run_tier(Tier::BaselineRefresh).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(report.rebuilt, 1);
        assert!(engine.registry().get("sensor.b").is_none());
        assert!(engine.store().get("sensor.b").is_none());
    }

    #[tokio::test]
    async fn test_report_tier_without_summarizer() {
        let (engine, _sink) = engine_with(Config::default(), Arc::new(MemorySource::new())).await;
        let err = engine.run_tier(Tier::Report).await.unwrap_err();
        assert!(matches!(err, DetectError::Configuration(_)));
    }
}
