//! Scheduler service.
//!
//! Runs as a background task that owns the [`TimerCoordinator`]. Commands
//! from [`SchedulerHandle`]s and events from timer and arbitration tasks are
//! processed one at a time on a single loop.

use crate::arbiter::{DEFAULT_WAIT_RETRY_SECONDS, TaskInteractionArbiter};
use crate::clock::Clock;
use crate::coordinator::{TimerCoordinator, TimerEvent, TimerPhase};
use crate::error::SchedulerError;
use crate::gateway::AgentGateway;
use crate::record::{SchedulePatch, ScheduleRecord};
use crate::store::{LoadReport, ScheduleStore};
use cadence_core::{Result, ScheduleId};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Tunables for the scheduler service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerOptions {
    /// Seconds the wait policy defers a run while the agent is busy.
    #[serde(default = "default_wait_retry_seconds")]
    pub wait_retry_seconds: u64,
}

fn default_wait_retry_seconds() -> u64 {
    DEFAULT_WAIT_RETRY_SECONDS
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            wait_retry_seconds: default_wait_retry_seconds(),
        }
    }
}

/// Records and timer phases at a point in time.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    /// All readable records.
    pub records: Vec<ScheduleRecord>,
    /// Phase of every schedule that has a timer or is arbitrating.
    pub phases: HashMap<ScheduleId, TimerPhase>,
}

type Reply<T> = oneshot::Sender<std::result::Result<T, SchedulerError>>;

enum SchedulerCommand {
    Reload(Reply<LoadReport>),
    SetActive {
        id: ScheduleId,
        active: bool,
        reply: Reply<bool>,
    },
    Update {
        id: ScheduleId,
        patch: Box<SchedulePatch>,
        reply: Reply<ScheduleRecord>,
    },
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle for interacting with a running scheduler service.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    store: ScheduleStore,
}

impl SchedulerHandle {
    /// Re-reads the schedules file and re-arms every schedule.
    pub async fn reload(&self) -> Result<LoadReport, SchedulerError> {
        self.request(SchedulerCommand::Reload).await
    }

    /// Activates or deactivates a schedule. Returns whether anything changed.
    pub async fn set_active(&self, id: &ScheduleId, active: bool) -> Result<bool, SchedulerError> {
        let id = id.clone();
        self.request(|reply| SchedulerCommand::SetActive { id, active, reply })
            .await
    }

    /// Applies a patch to a schedule and re-arms it.
    pub async fn update_schedule(
        &self,
        id: &ScheduleId,
        patch: SchedulePatch,
    ) -> Result<ScheduleRecord, SchedulerError> {
        let id = id.clone();
        self.request(|reply| SchedulerCommand::Update {
            id,
            patch: Box::new(patch),
            reply,
        })
        .await
    }

    /// Returns the current records and timer phases.
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| SchedulerError::ServiceStopped.into())
    }

    /// Counts schedules that are not deactivated.
    pub async fn active_count(&self) -> usize {
        self.store.active_count().await
    }

    /// Stops the service and cancels all pending timers.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Shutdown(reply)).await?;
        rx.await.map_err(|_| SchedulerError::ServiceStopped.into())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> SchedulerCommand,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        let result = rx.await.map_err(|_| SchedulerError::ServiceStopped)?;
        Ok(result?)
    }

    async fn send(&self, command: SchedulerCommand) -> Result<(), SchedulerError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::ServiceStopped)?;
        Ok(())
    }
}

/// The scheduler service.
pub struct SchedulerService {
    store: ScheduleStore,
    gateway: Arc<dyn AgentGateway>,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
}

impl SchedulerService {
    /// Creates a scheduler service.
    #[must_use]
    pub fn new(
        store: ScheduleStore,
        gateway: Arc<dyn AgentGateway>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            options,
        }
    }

    /// Loads the schedules, arms their timers and spawns the service loop.
    ///
    /// Returns a handle for interacting with the service.
    pub async fn start(self) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            command_tx,
            store: self.store.clone(),
        };

        if let Err(e) = self.store.load().await {
            error!(error = %e, "Failed to load schedules");
        }

        let wait_retry =
            chrono::Duration::from_std(Duration::from_secs(self.options.wait_retry_seconds))
                .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_WAIT_RETRY_SECONDS as i64));
        let arbiter = TaskInteractionArbiter::new(self.gateway, self.store.clone(), self.clock.clone())
            .with_wait_retry(wait_retry);
        let mut coordinator =
            TimerCoordinator::new(self.store.clone(), arbiter, self.clock.clone(), events_tx);

        let records = self.store.records().await;
        coordinator.reconcile_all(&records).await;

        tokio::spawn(run(coordinator, self.store, self.clock, command_rx, events_rx));
        handle
    }
}

async fn run(
    mut coordinator: TimerCoordinator,
    store: ScheduleStore,
    clock: Arc<dyn Clock>,
    mut command_rx: mpsc::Receiver<SchedulerCommand>,
    mut events_rx: mpsc::UnboundedReceiver<TimerEvent>,
) {
    info!("Scheduler service started");

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                if let SchedulerCommand::Shutdown(reply) = command {
                    coordinator.cancel_all();
                    info!("Scheduler service shutting down");
                    let _ = reply.send(());
                    break;
                }
                handle_command(&mut coordinator, &store, clock.as_ref(), command).await;
            }
            Some(event) = events_rx.recv() => {
                coordinator.handle_event(event).await;
            }
        }
    }

    coordinator.cancel_all();
}

async fn handle_command(
    coordinator: &mut TimerCoordinator,
    store: &ScheduleStore,
    clock: &dyn Clock,
    command: SchedulerCommand,
) {
    match command {
        SchedulerCommand::Reload(reply) => {
            let result = match store.reload().await {
                Ok(report) => {
                    let records = store.records().await;
                    coordinator.reconcile_all(&records).await;
                    Ok(report)
                }
                Err(e) => {
                    warn!(error = %e, "Reload failed, keeping current schedules");
                    Err(storage_error(e))
                }
            };
            let _ = reply.send(result);
        }
        SchedulerCommand::SetActive { id, active, reply } => {
            let result = set_active(coordinator, store, clock, &id, active).await;
            let _ = reply.send(result);
        }
        SchedulerCommand::Update { id, patch, reply } => {
            let result = match store
                .update_one(&id, (*patch).with_updated_at(clock.now().to_utc()))
                .await
            {
                Ok(record) => {
                    coordinator.arm_one(&record).await;
                    Ok(record)
                }
                Err(e) => Err(storage_error(e)),
            };
            let _ = reply.send(result);
        }
        SchedulerCommand::Snapshot(reply) => {
            let _ = reply.send(SchedulerSnapshot {
                records: store.records().await,
                phases: coordinator.armed(),
            });
        }
        SchedulerCommand::Shutdown(reply) => {
            let _ = reply.send(());
        }
    }
}

async fn set_active(
    coordinator: &mut TimerCoordinator,
    store: &ScheduleStore,
    clock: &dyn Clock,
    id: &ScheduleId,
    active: bool,
) -> std::result::Result<bool, SchedulerError> {
    let changed = store.set_active(id, active).await.map_err(storage_error)?;
    if !changed {
        debug!(schedule_id = %id, active, "Schedule already in requested state");
        return Ok(false);
    }

    let record = store
        .update_one(
            id,
            SchedulePatch::default().with_updated_at(clock.now().to_utc()),
        )
        .await
        .map_err(storage_error)?;
    info!(schedule_id = %id, active, "Schedule state changed");
    coordinator.arm_one(&record).await;
    Ok(true)
}

fn storage_error(error: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Storage {
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::{TokioClock, at};
    use crate::gateway::test_support::FakeAgent;
    use crate::record::TimeUnit;
    use crate::store::test_support::seeded;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn id(s: &str) -> ScheduleId {
        s.parse().unwrap()
    }

    fn hourly(name: &str) -> ScheduleRecord {
        ScheduleRecord::new(id(name), name, 1, TimeUnit::Hour)
            .with_start(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(), 9, 0)
            .with_task("code", format!("run {name}"))
    }

    async fn start(
        records: Vec<ScheduleRecord>,
        agent: Arc<FakeAgent>,
    ) -> (TempDir, ScheduleStore, SchedulerHandle) {
        let (dir, store) = seeded(records).await;
        let clock = Arc::new(TokioClock::starting_at(at(2025, 3, 13, 14, 0)));
        let service =
            SchedulerService::new(store.clone(), agent, clock, SchedulerOptions::default());
        let handle = service.start().await;
        (dir, store, handle)
    }

    async fn phase_of(handle: &SchedulerHandle, name: &str) -> Option<TimerPhase> {
        handle
            .snapshot()
            .await
            .expect("snapshot")
            .phases
            .get(&id(name))
            .copied()
    }

    #[tokio::test(start_paused = true)]
    async fn start_arms_active_schedules() {
        let mut paused = hourly("b");
        paused.active = false;
        let (_dir, _store, handle) =
            start(vec![hourly("a"), paused], Arc::new(FakeAgent::idle())).await;

        assert_eq!(
            phase_of(&handle, "a").await,
            Some(TimerPhase::Armed { at: at(2025, 3, 13, 15, 0) })
        );
        assert_eq!(phase_of(&handle, "b").await, None);
        assert_eq!(handle.active_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_schedule_when_due() {
        let agent = Arc::new(FakeAgent::idle());
        let (_dir, store, handle) = start(vec![hourly("a")], agent.clone()).await;

        let mut rearmed = false;
        for _ in 0..120 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if phase_of(&handle, "a").await == Some(TimerPhase::Armed { at: at(2025, 3, 13, 16, 0) }) {
                rearmed = true;
                break;
            }
        }
        assert!(rearmed, "schedule was not re-armed after firing");
        assert_eq!(agent.started(), vec![("code".to_string(), "run a".to_string())]);

        let record = store.get(&id("a")).await.unwrap();
        assert_eq!(record.last_execution_time, Some(at(2025, 3, 13, 15, 0).to_utc()));
    }

    #[tokio::test(start_paused = true)]
    async fn set_active_toggles_timer() {
        let (_dir, store, handle) = start(vec![hourly("a")], Arc::new(FakeAgent::idle())).await;

        assert!(handle.set_active(&id("a"), false).await.unwrap());
        assert_eq!(phase_of(&handle, "a").await, None);
        let record = store.get(&id("a")).await.unwrap();
        assert!(!record.active);
        let stamped = record.updated_at.expect("updatedAt");
        assert!(stamped >= at(2025, 3, 13, 14, 0).to_utc());
        assert!(stamped < at(2025, 3, 13, 15, 0).to_utc());

        assert!(!handle.set_active(&id("a"), false).await.unwrap());

        assert!(handle.set_active(&id("a"), true).await.unwrap());
        assert!(matches!(
            phase_of(&handle, "a").await,
            Some(TimerPhase::Armed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn set_active_on_missing_schedule_fails() {
        let (_dir, _store, handle) = start(vec![], Arc::new(FakeAgent::idle())).await;
        assert!(handle.set_active(&id("ghost"), true).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn update_rearms_with_new_interval() {
        let (_dir, _store, handle) = start(vec![hourly("a")], Arc::new(FakeAgent::idle())).await;

        let patch = SchedulePatch {
            time_unit: Some(Some(TimeUnit::Minute.to_string())),
            time_interval: Some(Some(20)),
            ..SchedulePatch::default()
        };
        let updated = handle.update_schedule(&id("a"), patch).await.unwrap();
        assert_eq!(updated.time_interval, Some(20));
        assert_eq!(updated.updated_at, Some(at(2025, 3, 13, 14, 0).to_utc()));
        assert_eq!(
            phase_of(&handle, "a").await,
            Some(TimerPhase::Armed { at: at(2025, 3, 13, 14, 20) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reload_picks_up_external_edits() {
        let (_dir, store, handle) = start(vec![hourly("a")], Arc::new(FakeAgent::idle())).await;

        let document = serde_json::json!({ "schedules": [hourly("a"), hourly("b")] });
        tokio::fs::write(store.path(), document.to_string())
            .await
            .unwrap();

        let report = handle.reload().await.unwrap();
        assert_eq!(report.loaded, 2);
        assert!(matches!(
            phase_of(&handle, "b").await,
            Some(TimerPhase::Armed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_failure_keeps_timers() {
        let (_dir, store, handle) = start(vec![hourly("a")], Arc::new(FakeAgent::idle())).await;

        tokio::fs::write(store.path(), "{ broken").await.unwrap();
        assert!(handle.reload().await.is_err());
        assert!(matches!(
            phase_of(&handle, "a").await,
            Some(TimerPhase::Armed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_service() {
        let (_dir, _store, handle) = start(vec![hourly("a")], Arc::new(FakeAgent::idle())).await;

        handle.shutdown().await.unwrap();
        tokio::task::yield_now().await;
        assert!(handle.snapshot().await.is_err());
    }

    #[test]
    fn options_default_retry() {
        let options: SchedulerOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, SchedulerOptions::default());
        assert_eq!(options.wait_retry_seconds, 60);
    }
}
