//! Learned per-entity baselines.
//!
//! One model per entity kind:
//! - numeric: mean and sample standard deviation (Welford's streaming update)
//! - binary: transition counting and state durations
//! - categorical: label frequency table
//!
//! Building is a pure function of the samples and the window, so identical
//! history always yields bit-identical models.

pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::{Sample, SampleValue};
use crate::detect::DetectError;
use crate::entity::EntityKind;

pub use self::store::{BaselineStore, ModelPersistence, SensitivityReset};

/// The time span a baseline was learned over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BaselineWindow {
    /// A window of exactly `days` ending at `anchor`.
    pub fn ending_at(anchor: DateTime<Utc>, days: u32) -> Self {
        Self {
            start: anchor - Duration::days(i64::from(days)),
            end: anchor,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericBaseline {
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: u64,
    pub window: BaselineWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryBaseline {
    /// Transitions per hour over the window.
    pub flip_rate_per_hour: f64,
    pub transitions: u64,
    /// Fraction of observed time spent in the `true` state.
    pub on_ratio: f64,
    pub mean_on_secs: f64,
    pub mean_off_secs: f64,
    pub sample_count: u64,
    pub window: BaselineWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalBaseline {
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
    pub window: BaselineWindow,
}

impl CategoricalBaseline {
    /// Relative frequency of `label`; zero for labels never seen.
    pub fn frequency(&self, label: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.counts.get(label).copied().unwrap_or(0) as f64 / self.total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Baseline {
    Numeric(NumericBaseline),
    Binary(BinaryBaseline),
    Categorical(CategoricalBaseline),
}

impl Baseline {
    pub fn kind(&self) -> EntityKind {
        match self {
            Baseline::Numeric(_) => EntityKind::Numeric,
            Baseline::Binary(_) => EntityKind::Binary,
            Baseline::Categorical(_) => EntityKind::Categorical,
        }
    }

    pub fn window(&self) -> BaselineWindow {
        match self {
            Baseline::Numeric(b) => b.window,
            Baseline::Binary(b) => b.window,
            Baseline::Categorical(b) => b.window,
        }
    }

    pub fn sample_count(&self) -> u64 {
        match self {
            Baseline::Numeric(b) => b.sample_count,
            Baseline::Binary(b) => b.sample_count,
            Baseline::Categorical(b) => b.total,
        }
    }

    /// One-line human summary, carried on findings.
    pub fn summary(&self) -> String {
        match self {
            Baseline::Numeric(b) => format!(
                "mean={:.3} std_dev={:.3} n={}",
                b.mean, b.std_dev, b.sample_count
            ),
            Baseline::Binary(b) => format!(
                "flip_rate={:.3}/h transitions={} on_ratio={:.2}",
                b.flip_rate_per_hour, b.transitions, b.on_ratio
            ),
            Baseline::Categorical(b) => {
                let labels: Vec<String> = b
                    .counts
                    .iter()
                    .map(|(label, count)| format!("{label}:{:.2}", *count as f64 / b.total as f64))
                    .collect();
                format!("{} (n={})", labels.join(" "), b.total)
            }
        }
    }
}

/// Welford's streaming mean/variance accumulator.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample standard deviation (n - 1); zero below two samples.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }
}

/// Build a baseline of `kind` from `samples`, keeping only those inside
/// `window`. Fails with `InsufficientData` below `min_samples`.
pub fn build_baseline(
    kind: EntityKind,
    samples: impl IntoIterator<Item = Sample>,
    window: BaselineWindow,
    min_samples: usize,
) -> Result<Baseline, DetectError> {
    let in_window = samples.into_iter().filter(|s| window.contains(s.timestamp));

    let baseline = match kind {
        EntityKind::Numeric => {
            let mut stats = RunningStats::default();
            for sample in in_window {
                if let SampleValue::Numeric(v) = sample.value {
                    stats.push(v);
                }
            }
            ensure_enough(stats.count() as usize, min_samples)?;
            Baseline::Numeric(NumericBaseline {
                mean: stats.mean(),
                std_dev: stats.std_dev(),
                sample_count: stats.count(),
                window,
            })
        }
        EntityKind::Binary => {
            let states: Vec<(DateTime<Utc>, bool)> = in_window
                .filter_map(|s| match s.value {
                    SampleValue::Binary(b) => Some((s.timestamp, b)),
                    _ => None,
                })
                .collect();
            ensure_enough(states.len(), min_samples)?;
            Baseline::Binary(binary_model(&states, window))
        }
        EntityKind::Categorical => {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            let mut total = 0u64;
            for sample in in_window {
                if let SampleValue::Categorical(label) = sample.value {
                    *counts.entry(label).or_default() += 1;
                    total += 1;
                }
            }
            ensure_enough(total as usize, min_samples)?;
            Baseline::Categorical(CategoricalBaseline {
                counts,
                total,
                window,
            })
        }
    };
    Ok(baseline)
}

fn ensure_enough(have: usize, needed: usize) -> Result<(), DetectError> {
    if have < needed {
        return Err(DetectError::InsufficientData { needed, have });
    }
    Ok(())
}

fn binary_model(states: &[(DateTime<Utc>, bool)], window: BaselineWindow) -> BinaryBaseline {
    let mut transitions = 0u64;
    let (mut on_secs, mut off_secs) = (0f64, 0f64);
    let (mut on_runs, mut off_runs) = (0u64, 0u64);

    for (i, &(ts, state)) in states.iter().enumerate() {
        let changed = i == 0 || states[i - 1].1 != state;
        if i > 0 && changed {
            transitions += 1;
        }
        if changed {
            if state {
                on_runs += 1;
            } else {
                off_runs += 1;
            }
        }
        let until = states.get(i + 1).map(|(next, _)| *next).unwrap_or(window.end);
        let held = (until - ts).num_milliseconds().max(0) as f64 / 1000.0;
        if state {
            on_secs += held;
        } else {
            off_secs += held;
        }
    }

    let hours = window.hours();
    let observed = on_secs + off_secs;
    BinaryBaseline {
        flip_rate_per_hour: if hours > 0.0 { transitions as f64 / hours } else { 0.0 },
        transitions,
        on_ratio: if observed > 0.0 { on_secs / observed } else { 0.0 },
        mean_on_secs: if on_runs > 0 { on_secs / on_runs as f64 } else { 0.0 },
        mean_off_secs: if off_runs > 0 { off_secs / off_runs as f64 } else { 0.0 },
        sample_count: states.len() as u64,
        window,
    }
}

/// Transitions per hour among `samples` over a window of `window` length.
pub fn flip_rate(samples: &[Sample], window: Duration) -> f64 {
    let hours = window.num_seconds() as f64 / 3600.0;
    if hours <= 0.0 {
        return 0.0;
    }
    let transitions = samples
        .windows(2)
        .filter(|pair| pair[0].value != pair[1].value)
        .count();
    transitions as f64 / hours
}
