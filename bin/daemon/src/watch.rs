//! Reloads the scheduler when the schedules file is edited by someone else.

use cadence_scheduler::{ScheduleStore, SchedulerHandle};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Polls the schedules file and reloads the scheduler on external edits.
///
/// A reload failure is logged once and retried on every tick until the
/// file parses again. Runs until the task is aborted.
pub async fn watch_schedules(store: ScheduleStore, handle: SchedulerHandle, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failing = false;

    loop {
        interval.tick().await;
        if !store.has_external_changes().await {
            continue;
        }

        debug!(path = %store.path().display(), "Schedules file changed");
        match handle.reload().await {
            Ok(report) => {
                failing = false;
                info!(
                    loaded = report.loaded,
                    quarantined = report.quarantined,
                    "Reloaded schedules"
                );
            }
            Err(e) => {
                if !failing {
                    warn!(error = %e, "Failed to reload schedules");
                }
                failing = true;
            }
        }
    }
}
