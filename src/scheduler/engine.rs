//! Scheduler execution loop: one task per registered tier.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::detect::{DetectError, Engine};

use super::Tier;

/// Run every registered tier until the engine's cancellation token fires.
/// An in-flight tick finishes the entity it is on before its task exits.
pub async fn run_scheduler_loop(engine: Engine) {
    let tracker = TaskTracker::new();
    for tier in Tier::ALL {
        if !engine.schedule().is_registered(tier) {
            continue;
        }
        let engine = engine.clone();
        tracker.spawn(async move { run_tier_loop(engine, tier).await });
    }
    tracker.close();
    info!(tiers = tracker.len(), "scheduler engine started");

    tracker.wait().await;
    info!("scheduler engine stopped");
}

async fn run_tier_loop(engine: Engine, tier: Tier) {
    let cancel = engine.cancel_token();
    loop {
        if !wait_until_due(&engine, tier, &cancel).await {
            return;
        }

        match engine.run_tier(tier).await {
            Ok(report) => info!(
                %tier,
                evaluated = report.evaluated,
                findings = report.findings,
                degraded = report.degraded,
                skipped = report.skipped,
                "tier run complete"
            ),
            Err(DetectError::TierBusy(_)) => {
                debug!(%tier, "previous run still in flight");
                // Yield to the operator-triggered run before checking again.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            Err(e) => warn!(%tier, error = %e, "tier run failed"),
        }
    }
}

/// Sleep until the tier is due. The due time is read again after each wake,
/// so a run started elsewhere pushes the tick back. False on cancellation or
/// when the tier is not registered.
async fn wait_until_due(engine: &Engine, tier: Tier, cancel: &CancellationToken) -> bool {
    loop {
        let now = Utc::now();
        let Some(due) = engine.schedule().next_due(tier, now) else {
            return false;
        };
        if due <= now {
            return !cancel.is_cancelled();
        }
        let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
        debug!(%tier, ?wait, "waiting for next tick");

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
