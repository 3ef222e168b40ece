//! Offline replay: run the full engine over a recorded history file instead
//! of a live host.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, SubsecRound, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::detect::engine::TierReport;
use crate::detect::{Engine, Finding};
use crate::entity::Entity;
use crate::scheduler::Tier;
use crate::sink::LogSink;
use crate::source::MemorySource;
use crate::storage::open_memory_pool;

#[derive(Debug, Serialize)]
pub struct ReplayOutcome {
    pub entities: Vec<Entity>,
    pub baselines: usize,
    pub tiers: Vec<TierResult>,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Serialize)]
pub struct TierResult {
    pub tier: Tier,
    pub report: TierReport,
}

/// Replay `history` through one refresh pass and one pass of each
/// evaluation tier. The recording is shifted so its newest state is one
/// second old. When the configuration names no entities, every entity in
/// the recording is monitored at standard priority.
pub async fn replay(config: &Config, history: &Path) -> Result<ReplayOutcome> {
    let source = MemorySource::from_json_file(history)?;
    source.rebase_to(Utc::now().trunc_subsecs(0) - Duration::seconds(1));

    let mut config = config.clone();
    if config.monitored.standard.is_empty() && config.monitored.priority.is_empty() {
        config.monitored.standard = source.entity_ids();
    }
    config.monitored.prune_missing = false;
    config.learning.enabled = false;
    config.reports.enabled = false;

    let pool = open_memory_pool().context("failed to open replay database")?;
    let engine = Engine::open(config, pool, Arc::new(source), Arc::new(LogSink), None)
        .await
        .context("failed to start replay engine")?;

    let mut tiers = Vec::new();
    for tier in [Tier::BaselineRefresh, Tier::Priority, Tier::Standard] {
        let report = engine
            .run_tier(tier)
            .await
            .with_context(|| format!("{tier} pass failed during replay"))?;
        tiers.push(TierResult { tier, report });
    }

    let findings = engine.findings().list_recent(1000, None).await?;
    let outcome = ReplayOutcome {
        entities: engine.registry().all(),
        baselines: engine.store().snapshot().len(),
        tiers,
        findings,
    };
    info!(
        path = %history.display(),
        entities = outcome.entities.len(),
        findings = outcome.findings.len(),
        "replay finished"
    );
    Ok(outcome)
}
