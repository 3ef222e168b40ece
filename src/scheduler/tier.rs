//! Tier identities and their schedule state.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::DetectError;

use super::cron::Cadence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Standard,
    Priority,
    BaselineRefresh,
    Report,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Priority, Tier::Standard, Tier::BaselineRefresh, Tier::Report];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Priority => "priority",
            Tier::BaselineRefresh => "baseline_refresh",
            Tier::Report => "report",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Tier::Standard),
            "priority" => Ok(Tier::Priority),
            "baseline_refresh" | "refresh" => Ok(Tier::BaselineRefresh),
            "report" => Ok(Tier::Report),
            other => Err(DetectError::Configuration(format!("unknown tier '{other}'"))),
        }
    }
}

/// Schedule state of one tier, as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub cadence: String,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub consecutive_failures: u32,
    pub next_due: DateTime<Utc>,
}

struct Slot {
    cadence: Cadence,
    running: bool,
    last_run: Option<DateTime<Utc>>,
    last_outcome: Option<String>,
    consecutive_failures: u32,
}

/// Per-tier Idle/Running state, last runs and retry backoff.
pub struct ScheduleBook {
    slots: Mutex<HashMap<Tier, Slot>>,
    retry_backoff: Duration,
}

/// Held while a tier runs; dropping it returns the tier to idle.
pub struct TierRun<'a> {
    book: &'a ScheduleBook,
    tier: Tier,
}

impl Drop for TierRun<'_> {
    fn drop(&mut self) {
        let mut slots = self.book.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&self.tier) {
            slot.running = false;
        }
    }
}

impl ScheduleBook {
    pub fn new(retry_backoff: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            retry_backoff,
        }
    }

    pub fn register(&self, tier: Tier, cadence: Cadence) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(
            tier,
            Slot {
                cadence,
                running: false,
                last_run: None,
                last_outcome: None,
                consecutive_failures: 0,
            },
        );
    }

    pub fn is_registered(&self, tier: Tier) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&tier)
    }

    /// Seed a persisted last-run time.
    pub fn restore(&self, tier: Tier, last_run: DateTime<Utc>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&tier) {
            slot.last_run = Some(last_run);
        }
    }

    /// Move a tier to Running. Refused while a run of the same tier is in
    /// flight. Tiers that were never registered may still be run on demand.
    pub fn begin(&self, tier: Tier) -> Result<TierRun<'_>, DetectError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(tier).or_insert_with(|| Slot {
            cadence: Cadence::Every(Duration::days(1)),
            running: false,
            last_run: None,
            last_outcome: None,
            consecutive_failures: 0,
        });
        if slot.running {
            return Err(DetectError::TierBusy(tier));
        }
        slot.running = true;
        Ok(TierRun { book: self, tier })
    }

    /// Record how a run ended. A failed run counts toward backoff.
    pub fn finish(&self, tier: Tier, at: DateTime<Utc>, succeeded: bool, outcome: String) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&tier) {
            slot.last_run = Some(at);
            slot.last_outcome = Some(outcome);
            slot.consecutive_failures = if succeeded { 0 } else { slot.consecutive_failures + 1 };
        }
    }

    fn due(&self, slot: &Slot, now: DateTime<Utc>) -> DateTime<Utc> {
        let Some(last) = slot.last_run else {
            return match slot.cadence {
                Cadence::Every(_) => now,
                Cadence::Cron { .. } => slot.cadence.next_after(now),
            };
        };
        if slot.consecutive_failures > 0 {
            let cap = slot.cadence.interval_near(last);
            let exp = (slot.consecutive_failures - 1).min(16);
            let backoff = self.retry_backoff * 2i32.pow(exp);
            return last + backoff.min(cap);
        }
        slot.cadence.next_after(last)
    }

    /// When the tier should next run; `now` or earlier means immediately.
    pub fn next_due(&self, tier: Tier, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&tier).map(|slot| self.due(slot, now))
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<TierStatus> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Tier::ALL
            .iter()
            .filter_map(|tier| {
                slots.get(tier).map(|slot| TierStatus {
                    tier: *tier,
                    cadence: slot.cadence.describe(),
                    running: slot.running,
                    last_run: slot.last_run,
                    last_outcome: slot.last_outcome.clone(),
                    consecutive_failures: slot.consecutive_failures,
                    next_due: self.due(slot, now),
                })
            })
            .collect()
    }
}
