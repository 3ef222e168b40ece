//! Anomaly detection: error taxonomy, severities, findings and the evaluator.

pub mod anomaly;
pub mod engine;
pub mod finding;
pub mod thresholds;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::EntityKind;
use crate::scheduler::Tier;

pub use self::anomaly::{evaluate, Observation, Verdict};
pub use self::engine::Engine;
pub use self::finding::FindingLog;
pub use self::thresholds::{BinaryThresholds, SeverityBreakpoints, ThresholdPolicy, Thresholds};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("cannot classify {entity}: {reason}")]
    Classification { entity: String, reason: String },

    #[error("entity {entity} cannot be modeled: {reason}")]
    UnsuitableEntity { entity: String, reason: String },

    #[error("state source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("finding {0} not found")]
    FindingNotFound(Uuid),

    #[error("entity {0} is not monitored")]
    UnknownEntity(String),

    #[error("{0} tier is already running")]
    TierBusy(Tier),
}

impl DetectError {
    /// Short machine-readable tag, used in degraded-status records.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectError::Classification { .. } => "classification",
            DetectError::UnsuitableEntity { .. } => "unsuitable_entity",
            DetectError::SourceUnavailable(_) => "source_unavailable",
            DetectError::InsufficientData { .. } => "insufficient_data",
            DetectError::Configuration(_) => "configuration",
            DetectError::Storage(_) => "storage",
            DetectError::FindingNotFound(_) => "finding_not_found",
            DetectError::UnknownEntity(_) => "unknown_entity",
            DetectError::TierBusy(_) => "tier_busy",
        }
    }

    pub(crate) fn storage(err: impl fmt::Display) -> Self {
        DetectError::Storage(err.to_string())
    }
}

/// Severity levels for anomaly findings, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

impl FromStr for Severity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(DetectError::Configuration(format!("unknown severity '{other}'"))),
        }
    }
}

/// A single anomaly detection result.
///
/// Findings are append-only. The only mutation after creation is the
/// false-positive flag set by the feedback adjuster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub entity_id: String,
    pub kind: EntityKind,
    pub tier: Tier,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub observed: Observation,
    pub score: f64,
    pub baseline_summary: String,
    /// Recorded during learning mode; never surfaced to the sink.
    pub suppressed: bool,
    pub false_positive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_alarm_reason: Option<String>,
}

impl Finding {
    pub fn new(
        entity_id: &str,
        kind: EntityKind,
        tier: Tier,
        timestamp: DateTime<Utc>,
        observed: Observation,
        verdict: Verdict,
        suppressed: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            kind,
            tier,
            timestamp,
            severity: verdict.severity,
            observed,
            // JSON has no infinity.
            score: verdict.score.min(f64::MAX),
            baseline_summary: verdict.baseline_summary,
            suppressed,
            false_positive: false,
            false_alarm_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!(matches!(
            "critical".parse::<Severity>(),
            Err(DetectError::Configuration(_))
        ));
    }
}
