//! In-memory state source, used for offline replay of recorded history.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::{EntityFilter, RawState, SourceError, StateSource};

#[derive(Debug, Default)]
pub struct MemorySource {
    states: RwLock<BTreeMap<String, Vec<RawState>>>,
    offline: AtomicBool,
    history_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a recorded history file: a JSON object mapping entity ids to
    /// arrays of `{ "value": ..., "timestamp": ... }`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read history file: {}", path.display()))?;
        let recorded: BTreeMap<String, Vec<RawState>> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse history file: {}", path.display()))?;

        let source = Self::new();
        for (entity_id, states) in recorded {
            for state in states {
                source.push(&entity_id, state);
            }
        }
        Ok(source)
    }

    pub fn insert(&self, entity_id: &str, value: impl Into<String>, timestamp: DateTime<Utc>) {
        self.push(entity_id, RawState::new(value, timestamp));
    }

    fn push(&self, entity_id: &str, state: RawState) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        let series = states.entry(entity_id.to_string()).or_default();
        let at = series.partition_point(|s| s.timestamp <= state.timestamp);
        series.insert(at, state);
    }

    pub fn remove(&self, entity_id: &str) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states.remove(entity_id);
    }

    /// Simulate the host going away; every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of history queries served so far.
    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    /// Latest recorded timestamp across all entities.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states
            .values()
            .filter_map(|series| series.last().map(|s| s.timestamp))
            .max()
    }

    /// Shift every recorded state so the newest one lands at `anchor`.
    pub fn rebase_to(&self, anchor: DateTime<Utc>) {
        let Some(latest) = self.latest_timestamp() else {
            return;
        };
        let offset = anchor - latest;
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        for state in states.values_mut().flatten() {
            state.timestamp += offset;
        }
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states.keys().cloned().collect()
    }

    fn check_online(&self) -> Result<(), SourceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("memory source is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateSource for MemorySource {
    async fn current_state(&self, entity_id: &str) -> Result<RawState, SourceError> {
        self.check_online()?;
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states
            .get(entity_id)
            .and_then(|series| series.last().cloned())
            .ok_or_else(|| SourceError::NotFound(entity_id.to_string()))
    }

    async fn history(
        &self,
        entity_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawState>, SourceError> {
        self.check_online()?;
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        Ok(states
            .get(entity_id)
            .map(|series| {
                series
                    .iter()
                    .filter(|s| s.timestamp >= from && s.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_entities(&self, filter: &EntityFilter) -> Result<BTreeSet<String>, SourceError> {
        self.check_online()?;
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        Ok(states
            .keys()
            .filter(|id| filter.matches(id))
            .cloned()
            .collect())
    }
}
