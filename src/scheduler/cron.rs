//! Tier cadences: fixed intervals or cron expressions.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::detect::DetectError;

/// How often a tier fires.
#[derive(Debug, Clone)]
pub enum Cadence {
    Every(Duration),
    Cron { expr: String, schedule: Box<CronSchedule> },
}

impl Cadence {
    /// Parse a cron expression (seconds field first, as the `cron` crate expects).
    pub fn cron(expr: &str) -> Result<Self, DetectError> {
        let schedule = CronSchedule::from_str(expr)
            .map_err(|e| DetectError::Configuration(format!("invalid cron expression '{expr}': {e}")))?;
        Ok(Cadence::Cron {
            expr: expr.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// The first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Cadence::Every(interval) => after + *interval,
            Cadence::Cron { schedule, .. } => schedule
                .after(&after)
                .next()
                .unwrap_or(after + Duration::days(1)),
        }
    }

    /// Spacing between consecutive fires after `from`, used to cap backoff.
    pub fn interval_near(&self, from: DateTime<Utc>) -> Duration {
        match self {
            Cadence::Every(interval) => *interval,
            Cadence::Cron { schedule, .. } => {
                let mut upcoming = schedule.after(&from);
                match (upcoming.next(), upcoming.next()) {
                    (Some(a), Some(b)) => b - a,
                    _ => Duration::days(1),
                }
            }
        }
    }

    /// Upcoming fire times within `hours` of `from`.
    pub fn preview(&self, from: DateTime<Utc>, hours: i64) -> Vec<DateTime<Utc>> {
        let end = from + Duration::hours(hours);
        let mut out = Vec::new();
        let mut at = from;
        loop {
            at = self.next_after(at);
            if at > end || out.len() >= 1000 {
                break;
            }
            out.push(at);
        }
        out
    }

    pub fn describe(&self) -> String {
        match self {
            Cadence::Every(interval) => format!("every {}s", interval.num_seconds()),
            Cadence::Cron { expr, .. } => format!("cron '{expr}'"),
        }
    }
}
