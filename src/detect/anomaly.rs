//! The evaluator: one observation against one baseline.
//!
//! Pure and stateless. Sensitivity is applied as a divisor on every
//! threshold, so a sensitivity below 1.0 widens the normal band.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::baseline::{Baseline, BinaryBaseline, CategoricalBaseline, NumericBaseline};

use super::thresholds::{SeverityBreakpoints, Thresholds};
use super::Severity;

/// What an evaluation tier observed for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Observation {
    Numeric(f64),
    /// Transitions per hour over the recent evaluation window.
    FlipRate(f64),
    Label(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub severity: Severity,
    /// Kind-specific magnitude: adjusted z-score, adjusted flip rate, or
    /// rarity (1 - frequency) of a label.
    pub score: f64,
    pub baseline_summary: String,
}

/// Compare an observation against the entity's baseline. A cold baseline
/// yields no verdict.
pub fn evaluate(
    observation: &Observation,
    baseline: Option<&Baseline>,
    thresholds: &Thresholds,
    sensitivity: f64,
    breakpoints: &SeverityBreakpoints,
) -> Option<Verdict> {
    let baseline = baseline?;
    let (severity, score) = match (observation, baseline) {
        (Observation::Numeric(x), Baseline::Numeric(b)) => {
            numeric(*x, b, thresholds.sigma, sensitivity, breakpoints)?
        }
        (Observation::FlipRate(rate), Baseline::Binary(b)) => binary(*rate, b, thresholds, sensitivity)?,
        (Observation::Label(label), Baseline::Categorical(b)) => categorical(label, b, thresholds)?,
        (observation, baseline) => {
            warn!(?observation, kind = %baseline.kind(), "observation does not match baseline kind");
            return None;
        }
    };
    Some(Verdict {
        severity,
        score,
        baseline_summary: baseline.summary(),
    })
}

fn numeric(
    x: f64,
    b: &NumericBaseline,
    sigma: f64,
    sensitivity: f64,
    breakpoints: &SeverityBreakpoints,
) -> Option<(Severity, f64)> {
    let deviation = (x - b.mean).abs();
    if deviation == 0.0 {
        return None;
    }
    if b.std_dev == 0.0 {
        return Some((Severity::High, f64::INFINITY));
    }
    let adjusted = deviation / b.std_dev * sensitivity;
    if adjusted <= sigma {
        return None;
    }
    Some((breakpoints.classify(adjusted), adjusted))
}

fn binary(
    rate: f64,
    _baseline: &BinaryBaseline,
    thresholds: &Thresholds,
    sensitivity: f64,
) -> Option<(Severity, f64)> {
    let adjusted = rate * sensitivity;
    let t = &thresholds.binary;
    let severity = if adjusted > t.high() {
        Severity::High
    } else if adjusted > t.medium() {
        Severity::Medium
    } else if adjusted > t.low() {
        Severity::Low
    } else {
        return None;
    };
    Some((severity, adjusted))
}

fn categorical(label: &str, b: &CategoricalBaseline, thresholds: &Thresholds) -> Option<(Severity, f64)> {
    let frequency = b.frequency(label);
    let unseen = b.counts.get(label).copied().unwrap_or(0) == 0;
    if unseen || frequency < thresholds.categorical_epsilon {
        return Some((thresholds.categorical_severity, 1.0 - frequency));
    }
    None
}
