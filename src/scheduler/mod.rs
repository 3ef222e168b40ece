//! Tiered scheduling: independent evaluation and refresh loops, the
//! learning-mode gate, and per-tier schedule state.

pub mod cron;
pub mod engine;
pub mod learning;
pub mod tier;

pub use self::cron::Cadence;
pub use self::engine::run_scheduler_loop;
pub use self::learning::{LearningGate, LearningStatus, LearningWindow};
pub use self::tier::{ScheduleBook, Tier, TierRun, TierStatus};
