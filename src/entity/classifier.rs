//! Entity classification from the shape of its current value.
//!
//! Real numbers are numeric, the boolean vocabulary is binary, and any other
//! short single-line label is categorical as long as the entity's history
//! stays within a bounded label set.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::collector::{is_missing, parse_binary, parse_numeric, SampleCollector, SampleValue};
use crate::detect::DetectError;

use super::EntityKind;

pub struct Classifier {
    collector: Arc<SampleCollector>,
    max_labels: usize,
    max_label_len: usize,
    window: Duration,
}

impl Classifier {
    pub fn new(
        collector: Arc<SampleCollector>,
        max_labels: usize,
        max_label_len: usize,
        window: Duration,
    ) -> Self {
        Self {
            collector,
            max_labels,
            max_label_len,
            window,
        }
    }

    pub async fn classify(&self, entity_id: &str) -> Result<EntityKind, DetectError> {
        self.classify_at(entity_id, Utc::now()).await
    }

    /// Classify using the categorical label window ending at `now`.
    pub async fn classify_at(
        &self,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EntityKind, DetectError> {
        let current = self.collector.current_raw(entity_id).await?;
        let kind = shape_of(entity_id, &current.value, self.max_label_len)?;
        if kind != EntityKind::Categorical {
            debug!(entity = %entity_id, %kind, "classified");
            return Ok(kind);
        }

        let labels: BTreeSet<String> = self
            .collector
            .collect_history(entity_id, EntityKind::Categorical, now - self.window, now)
            .await?
            .filter_map(|s| match s.value {
                SampleValue::Categorical(label) => Some(label),
                _ => None,
            })
            .chain(std::iter::once(current.value.trim().to_string()))
            .collect();

        if labels.len() > self.max_labels {
            return Err(DetectError::UnsuitableEntity {
                entity: entity_id.to_string(),
                reason: format!(
                    "{} distinct labels exceed the limit of {}",
                    labels.len(),
                    self.max_labels
                ),
            });
        }
        debug!(entity = %entity_id, labels = labels.len(), "classified as categorical");
        Ok(EntityKind::Categorical)
    }
}

/// Kind implied by a single raw value.
pub fn shape_of(entity_id: &str, raw: &str, max_label_len: usize) -> Result<EntityKind, DetectError> {
    if is_missing(raw) {
        return Err(DetectError::Classification {
            entity: entity_id.to_string(),
            reason: format!("no readable current value ('{}')", raw.trim()),
        });
    }
    if parse_numeric(raw).is_some() {
        return Ok(EntityKind::Numeric);
    }
    if parse_binary(raw).is_some() {
        return Ok(EntityKind::Binary);
    }
    let label = raw.trim();
    if label.contains('\n') || label.chars().count() > max_label_len {
        return Err(DetectError::Classification {
            entity: entity_id.to_string(),
            reason: "value is free text, not a bounded label".to_string(),
        });
    }
    Ok(EntityKind::Categorical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
    }

    fn classifier(source: Arc<MemorySource>) -> Classifier {
        let collector = Arc::new(SampleCollector::new(source, std::time::Duration::from_secs(1)));
        Classifier::new(collector, 3, 64, Duration::days(7))
    }

    #[test]
    fn test_shape_of_values() {
        assert_eq!(shape_of("s", "21.4", 64).unwrap(), EntityKind::Numeric);
        assert_eq!(shape_of("s", "-3", 64).unwrap(), EntityKind::Numeric);
        assert_eq!(shape_of("s", "off", 64).unwrap(), EntityKind::Binary);
        assert_eq!(shape_of("s", "closed", 64).unwrap(), EntityKind::Binary);
        assert_eq!(shape_of("s", "heat_cool", 64).unwrap(), EntityKind::Categorical);
        assert!(matches!(
            shape_of("s", "unavailable", 64),
            Err(DetectError::Classification { .. })
        ));
        assert!(matches!(
            shape_of("s", "line one\nline two", 64),
            Err(DetectError::Classification { .. })
        ));
        assert!(shape_of("s", &"x".repeat(65), 64).is_err());
    }

    #[tokio::test]
    async fn test_categorical_within_label_cap() {
        let source = Arc::new(MemorySource::new());
        for (i, label) in ["heat", "cool", "heat", "idle"].iter().enumerate() {
            source.insert("climate.lr", *label, now() - Duration::hours(10 - i as i64));
        }
        let kind = classifier(source).classify_at("climate.lr", now()).await.unwrap();
        assert_eq!(kind, EntityKind::Categorical);
    }

    #[tokio::test]
    async fn test_too_many_labels_is_unsuitable() {
        let source = Arc::new(MemorySource::new());
        for (i, label) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            source.insert("select.mode", *label, now() - Duration::hours(10 - i as i64));
        }
        let err = classifier(source).classify_at("select.mode", now()).await.unwrap_err();
        assert!(matches!(err, DetectError::UnsuitableEntity { .. }));
    }

    #[tokio::test]
    async fn test_missing_entity_fails_classification() {
        let source = Arc::new(MemorySource::new());
        let err = classifier(source).classify_at("sensor.ghost", now()).await.unwrap_err();
        assert!(matches!(err, DetectError::Classification { .. }));
    }
}
