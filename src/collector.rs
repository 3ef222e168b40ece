//! Sample collector: pulls entity states from the state source and
//! normalizes them into typed samples.
//!
//! Every call re-queries the source. Nothing is cached, so two baseline
//! builds over identical host history see identical samples.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detect::DetectError;
use crate::entity::EntityKind;
use crate::source::{EntityFilter, RawState, SourceError, StateSource};

/// Host states that carry no reading.
const MISSING_STATES: &[&str] = &["", "unavailable", "unknown"];

/// Boolean-like vocabulary, as (true, false) pairs.
const BINARY_VOCABULARY: &[(&str, &str)] = &[
    ("on", "off"),
    ("true", "false"),
    ("open", "closed"),
    ("home", "not_home"),
    ("detected", "clear"),
    ("locked", "unlocked"),
    ("yes", "no"),
];

pub fn is_missing(raw: &str) -> bool {
    let trimmed = raw.trim();
    MISSING_STATES.iter().any(|m| trimmed.eq_ignore_ascii_case(m))
}

pub fn parse_numeric(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_binary(raw: &str) -> Option<bool> {
    let trimmed = raw.trim();
    BINARY_VOCABULARY.iter().find_map(|(on, off)| {
        if trimmed.eq_ignore_ascii_case(on) {
            Some(true)
        } else if trimmed.eq_ignore_ascii_case(off) {
            Some(false)
        } else {
            None
        }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SampleValue {
    Numeric(f64),
    Binary(bool),
    Categorical(String),
}

impl SampleValue {
    /// Parse a raw host value for an entity of the given kind.
    pub fn parse(kind: EntityKind, raw: &str) -> Option<Self> {
        if is_missing(raw) {
            return None;
        }
        match kind {
            EntityKind::Numeric => parse_numeric(raw).map(SampleValue::Numeric),
            EntityKind::Binary => parse_binary(raw).map(SampleValue::Binary),
            EntityKind::Categorical => Some(SampleValue::Categorical(raw.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub entity_id: String,
    pub value: SampleValue,
    pub timestamp: DateTime<Utc>,
}

/// A finite, timestamp-ordered sequence of samples from one history query.
///
/// Normalization happens on demand as the sequence is consumed. Unreadable
/// host states are skipped.
pub struct Samples {
    entity_id: String,
    kind: EntityKind,
    raw: std::vec::IntoIter<RawState>,
}

impl Samples {
    fn new(entity_id: &str, kind: EntityKind, mut raw: Vec<RawState>) -> Self {
        raw.sort_by_key(|s| s.timestamp);
        Self {
            entity_id: entity_id.to_string(),
            kind,
            raw: raw.into_iter(),
        }
    }
}

impl Iterator for Samples {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        for state in self.raw.by_ref() {
            if let Some(value) = SampleValue::parse(self.kind, &state.value) {
                return Some(Sample {
                    entity_id: self.entity_id.clone(),
                    value,
                    timestamp: state.timestamp,
                });
            }
        }
        None
    }
}

pub struct SampleCollector {
    source: Arc<dyn StateSource>,
    timeout: Duration,
}

impl SampleCollector {
    pub fn new(source: Arc<dyn StateSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Bound a source call; a timeout is treated like an unreachable source.
    async fn bounded<T>(
        &self,
        entity_id: &str,
        call: impl std::future::Future<Output = Result<T, SourceError>>,
    ) -> Result<T, DetectError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(SourceError::Unavailable(msg))) => Err(DetectError::SourceUnavailable(msg)),
            Ok(Err(SourceError::NotFound(_))) => Err(DetectError::Classification {
                entity: entity_id.to_string(),
                reason: "host reports no such entity".to_string(),
            }),
            Err(_) => Err(DetectError::SourceUnavailable(format!(
                "no response within {:?}",
                self.timeout
            ))),
        }
    }

    /// Raw current state, used by the classifier.
    pub async fn current_raw(&self, entity_id: &str) -> Result<RawState, DetectError> {
        self.bounded(entity_id, self.source.current_state(entity_id)).await
    }

    pub async fn collect_history(
        &self,
        entity_id: &str,
        kind: EntityKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Samples, DetectError> {
        let raw = self
            .bounded(entity_id, self.source.history(entity_id, start, end))
            .await?;
        debug!(entity = %entity_id, raw = raw.len(), "collected history");
        Ok(Samples::new(entity_id, kind, raw))
    }

    /// History over a short window ending at `now`, materialized.
    pub async fn collect_recent(
        &self,
        entity_id: &str,
        kind: EntityKind,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Sample>, DetectError> {
        Ok(self
            .collect_history(entity_id, kind, now - window, now)
            .await?
            .collect())
    }

    /// The current value as a sample, or `None` when the host has no
    /// readable value right now.
    pub async fn collect_latest(
        &self,
        entity_id: &str,
        kind: EntityKind,
    ) -> Result<Option<Sample>, DetectError> {
        let raw = self.current_raw(entity_id).await?;
        Ok(SampleValue::parse(kind, &raw.value).map(|value| Sample {
            entity_id: entity_id.to_string(),
            value,
            timestamp: raw.timestamp,
        }))
    }

    pub async fn list_entities(&self, filter: &EntityFilter) -> Result<BTreeSet<String>, DetectError> {
        self.bounded("*", self.source.list_entities(filter)).await
    }
}
