//! Threshold configuration consumed by the evaluator.
//!
//! Everything here is validated at construction time. A `Thresholds` value
//! that exists is always usable; violations surface as
//! [`DetectError::Configuration`] and are never coerced.

use std::collections::HashMap;

use serde::Serialize;

use super::{DetectError, Severity};

/// Flip-rate thresholds (transitions per hour) for binary entities.
///
/// Invariant: `0 <= low < medium < high`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BinaryThresholds {
    low: f64,
    medium: f64,
    high: f64,
}

impl BinaryThresholds {
    pub fn new(low: f64, medium: f64, high: f64) -> Result<Self, DetectError> {
        if ![low, medium, high].iter().all(|v| v.is_finite() && *v >= 0.0) {
            return Err(DetectError::Configuration(format!(
                "binary flip thresholds must be finite and non-negative (got {low}, {medium}, {high})"
            )));
        }
        if !(low < medium && medium < high) {
            return Err(DetectError::Configuration(format!(
                "binary flip thresholds must satisfy low < medium < high (got {low}, {medium}, {high})"
            )));
        }
        Ok(Self { low, medium, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn medium(&self) -> f64 {
        self.medium
    }

    pub fn high(&self) -> f64 {
        self.high
    }
}

/// Multiples of the sensitivity-adjusted z-score at which a numeric finding
/// escalates. Anything above sigma but at or below `medium` is low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeverityBreakpoints {
    medium: f64,
    high: f64,
}

impl SeverityBreakpoints {
    pub fn new(medium: f64, high: f64) -> Result<Self, DetectError> {
        if !(medium.is_finite() && high.is_finite() && medium > 0.0 && medium < high) {
            return Err(DetectError::Configuration(format!(
                "severity breakpoints must satisfy 0 < medium < high (got {medium}, {high})"
            )));
        }
        Ok(Self { medium, high })
    }

    pub fn medium(&self) -> f64 {
        self.medium
    }

    pub fn classify(&self, multiple: f64) -> Severity {
        if multiple > self.high {
            Severity::High
        } else if multiple > self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl Default for SeverityBreakpoints {
    fn default() -> Self {
        Self {
            medium: 2.5,
            high: 4.0,
        }
    }
}

/// Effective thresholds for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thresholds {
    pub sigma: f64,
    pub binary: BinaryThresholds,
    /// Relative frequency below which a categorical label counts as unseen.
    pub categorical_epsilon: f64,
    pub categorical_severity: Severity,
}

impl Thresholds {
    pub fn new(
        sigma: f64,
        binary: BinaryThresholds,
        categorical_epsilon: f64,
        categorical_severity: Severity,
    ) -> Result<Self, DetectError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(DetectError::Configuration(format!(
                "sigma must be a positive number (got {sigma})"
            )));
        }
        if !(0.0..1.0).contains(&categorical_epsilon) {
            return Err(DetectError::Configuration(format!(
                "categorical epsilon must be in [0, 1) (got {categorical_epsilon})"
            )));
        }
        Ok(Self {
            sigma,
            binary,
            categorical_epsilon,
            categorical_severity,
        })
    }
}

/// Global defaults plus validated per-entity overrides.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    defaults: Thresholds,
    overrides: HashMap<String, Thresholds>,
    breakpoints: SeverityBreakpoints,
}

impl ThresholdPolicy {
    pub fn new(defaults: Thresholds, breakpoints: SeverityBreakpoints) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakpoints,
        }
    }

    pub fn with_override(mut self, entity_id: &str, thresholds: Thresholds) -> Self {
        self.overrides.insert(entity_id.to_string(), thresholds);
        self
    }

    pub fn defaults(&self) -> &Thresholds {
        &self.defaults
    }

    pub fn breakpoints(&self) -> &SeverityBreakpoints {
        &self.breakpoints
    }

    pub fn for_entity(&self, entity_id: &str) -> &Thresholds {
        self.overrides.get(entity_id).unwrap_or(&self.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_thresholds_must_increase() {
        assert!(BinaryThresholds::new(0.1, 0.3, 0.6).is_ok());
        for (l, m, h) in [(0.3, 0.1, 0.6), (0.1, 0.6, 0.3), (0.1, 0.1, 0.6), (0.1, 0.3, 0.3)] {
            assert!(matches!(
                BinaryThresholds::new(l, m, h),
                Err(DetectError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_rejects_negative_and_nan() {
        assert!(BinaryThresholds::new(-1.0, 0.3, 0.6).is_err());
        assert!(BinaryThresholds::new(f64::NAN, 0.3, 0.6).is_err());
    }

    #[test]
    fn test_sigma_must_be_positive() {
        let binary = BinaryThresholds::new(1.0, 2.0, 3.0).unwrap();
        assert!(Thresholds::new(0.0, binary, 0.01, Severity::Medium).is_err());
        assert!(Thresholds::new(2.0, binary, 1.5, Severity::Medium).is_err());
        assert!(Thresholds::new(2.0, binary, 0.01, Severity::Medium).is_ok());
    }

    #[test]
    fn test_breakpoints_classify() {
        let bp = SeverityBreakpoints::default();
        assert_eq!(bp.classify(1.5), Severity::Low);
        assert_eq!(bp.classify(3.0), Severity::Medium);
        assert_eq!(bp.classify(4.5), Severity::High);
        assert!(SeverityBreakpoints::new(4.0, 2.0).is_err());
    }

    #[test]
    fn test_policy_override_lookup() {
        let binary = BinaryThresholds::new(1.0, 2.0, 3.0).unwrap();
        let defaults = Thresholds::new(2.0, binary, 0.01, Severity::Medium).unwrap();
        let strict = Thresholds::new(4.0, binary, 0.01, Severity::High).unwrap();
        let policy = ThresholdPolicy::new(defaults, SeverityBreakpoints::default())
            .with_override("sensor.boiler", strict);

        assert_eq!(policy.for_entity("sensor.boiler").sigma, 4.0);
        assert_eq!(policy.for_entity("sensor.other").sigma, 2.0);
    }
}
