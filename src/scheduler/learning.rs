//! Learning mode: findings are still recorded but marked suppressed and
//! never delivered to the sink.

use std::collections::BTreeSet;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Global learning window, persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningWindow {
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningStatus {
    pub global: Option<LearningWindow>,
    pub entities: Vec<String>,
}

#[derive(Debug, Default)]
pub struct LearningGate {
    global: RwLock<Option<LearningWindow>>,
    entities: RwLock<BTreeSet<String>>,
}

impl LearningGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(&self, window: Option<LearningWindow>, entities: impl IntoIterator<Item = String>) {
        *self.global.write().unwrap_or_else(|e| e.into_inner()) = window;
        *self.entities.write().unwrap_or_else(|e| e.into_inner()) = entities.into_iter().collect();
    }

    /// Start global learning at `at`, optionally expiring after `days`.
    pub fn start(&self, at: DateTime<Utc>, days: Option<u32>) -> LearningWindow {
        let window = LearningWindow {
            started_at: at,
            expires_at: days.map(|d| at + Duration::days(i64::from(d))),
            active: true,
        };
        *self.global.write().unwrap_or_else(|e| e.into_inner()) = Some(window);
        window
    }

    /// End global learning. Returns the closed window, if one was open.
    pub fn stop(&self) -> Option<LearningWindow> {
        let mut global = self.global.write().unwrap_or_else(|e| e.into_inner());
        match global.as_mut() {
            Some(window) if window.active => {
                window.active = false;
                Some(*window)
            }
            _ => None,
        }
    }

    pub fn window(&self) -> Option<LearningWindow> {
        *self.global.read().unwrap_or_else(|e| e.into_inner())
    }

    fn global_active(&self, now: DateTime<Utc>) -> bool {
        self.window()
            .is_some_and(|w| w.active && w.expires_at.map_or(true, |exp| now < exp))
    }

    pub fn is_learning(&self, entity_id: &str, now: DateTime<Utc>) -> bool {
        self.global_active(now)
            || self
                .entities
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(entity_id)
    }

    /// Close the global window if its expiry has passed. Returns the closed
    /// window so the caller can persist it.
    pub fn expire_if_due(&self, now: DateTime<Utc>) -> Option<LearningWindow> {
        let due = self
            .window()
            .is_some_and(|w| w.active && w.expires_at.is_some_and(|exp| now >= exp));
        if due {
            self.stop()
        } else {
            None
        }
    }

    /// Put one entity in or out of learning. Returns true if that changed.
    pub fn set_entity(&self, entity_id: &str, learning: bool) -> bool {
        let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
        if learning {
            entities.insert(entity_id.to_string())
        } else {
            entities.remove(entity_id)
        }
    }

    pub fn status(&self) -> LearningStatus {
        LearningStatus {
            global: self.window(),
            entities: self
                .entities
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_global_window_expires() {
        let gate = LearningGate::new();
        gate.start(t0(), Some(7));
        assert!(gate.is_learning("sensor.t", t0() + Duration::days(6)));
        assert!(!gate.is_learning("sensor.t", t0() + Duration::days(7)));

        assert!(gate.expire_if_due(t0() + Duration::days(1)).is_none());
        let closed = gate.expire_if_due(t0() + Duration::days(8)).unwrap();
        assert!(!closed.active);
        assert!(gate.expire_if_due(t0() + Duration::days(9)).is_none());
    }

    #[test]
    fn test_entity_learning_is_independent() {
        let gate = LearningGate::new();
        assert!(gate.set_entity("sensor.new", true));
        assert!(!gate.set_entity("sensor.new", true));
        assert!(gate.is_learning("sensor.new", t0()));
        assert!(!gate.is_learning("sensor.old", t0()));
        gate.set_entity("sensor.new", false);
        assert!(!gate.is_learning("sensor.new", t0()));
    }

    #[test]
    fn test_open_ended_window() {
        let gate = LearningGate::new();
        gate.start(t0(), None);
        assert!(gate.is_learning("x", t0() + Duration::days(365)));
        assert!(gate.stop().is_some());
        assert!(!gate.is_learning("x", t0()));
    }
}
