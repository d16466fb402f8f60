//! Fire-time arbitration.
//!
//! When a schedule's timer fires, the arbiter decides whether to start a task
//! on the agent, defer, or skip, based on the record's activity gate and its
//! busy-agent policy. It only mutates the record through the store.

use crate::clock::Clock;
use crate::gateway::AgentGateway;
use crate::record::{SchedulePatch, ScheduleRecord, TaskInteraction};
use crate::store::ScheduleStore;
use cadence_core::{ScheduleId, TaskId};
use chrono::{DateTime, Duration, FixedOffset, Timelike};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default delay, in seconds, before a deferred run is retried.
pub const DEFAULT_WAIT_RETRY_SECONDS: u64 = 60;

/// What happened when a schedule fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// A task was started.
    Started { task_id: TaskId },
    /// Starting the task failed; the schedule keeps its normal cadence.
    StartFailed,
    /// The activity gate was not satisfied.
    NoActivity,
    /// The agent was busy and the skip policy applied.
    Skipped,
    /// The agent was busy and the wait policy deferred the run.
    Deferred { retry_at: DateTime<FixedOffset> },
    /// The agent could not be queried; retry without touching the record.
    Backoff { retry_at: DateTime<FixedOffset> },
    /// The schedule passed its expiration and was deactivated.
    Expired,
    /// The schedule is gone or inactive.
    Inactive,
}

impl FireOutcome {
    /// Returns the retry instant for outcomes that re-arm on a short horizon.
    #[must_use]
    pub fn retry_at(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Self::Deferred { retry_at } | Self::Backoff { retry_at } => Some(*retry_at),
            _ => None,
        }
    }
}

impl fmt::Display for FireOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { task_id } => write!(f, "started task {task_id}"),
            Self::StartFailed => write!(f, "start failed"),
            Self::NoActivity => write!(f, "no activity since last run"),
            Self::Skipped => write!(f, "skipped"),
            Self::Deferred { retry_at } => write!(f, "deferred until {retry_at}"),
            Self::Backoff { retry_at } => write!(f, "backing off until {retry_at}"),
            Self::Expired => write!(f, "expired"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// Decides what a firing schedule does.
#[derive(Clone)]
pub struct TaskInteractionArbiter {
    gateway: Arc<dyn AgentGateway>,
    store: ScheduleStore,
    clock: Arc<dyn Clock>,
    wait_retry: Duration,
}

impl TaskInteractionArbiter {
    /// Creates an arbiter with the default retry horizon.
    #[must_use]
    pub fn new(gateway: Arc<dyn AgentGateway>, store: ScheduleStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            gateway,
            store,
            clock,
            wait_retry: Duration::seconds(DEFAULT_WAIT_RETRY_SECONDS as i64),
        }
    }

    /// Sets how long the wait policy defers a run. Clamped to at least one
    /// second.
    #[must_use]
    pub fn with_wait_retry(mut self, wait_retry: Duration) -> Self {
        self.wait_retry = wait_retry.max(Duration::seconds(1));
        self
    }

    /// Runs the fire-time decision for one schedule.
    pub async fn arbitrate(&self, id: &ScheduleId) -> FireOutcome {
        let Some(record) = self.store.get(id).await else {
            return FireOutcome::Inactive;
        };
        if !record.active {
            return FireOutcome::Inactive;
        }
        let now = self.clock.now();

        if let Ok(Some(expires_at)) = record.expires_at() {
            if now.naive_local() > expires_at {
                info!(schedule_id = %id, "Schedule expired, deactivating");
                self.persist(
                    id,
                    SchedulePatch::default()
                        .with_active(false)
                        .with_next_execution_time(None),
                )
                .await;
                return FireOutcome::Expired;
            }
        }

        if record.require_activity && !self.has_new_activity(&record).await {
            debug!(schedule_id = %id, "No activity since last run");
            return FireOutcome::NoActivity;
        }

        let interaction = record.interaction();
        let busy = match self.gateway.has_active_task().await {
            Ok(busy) => busy,
            Err(e) if interaction == TaskInteraction::Wait => {
                warn!(schedule_id = %id, error = %e, "Failed to query agent state");
                return FireOutcome::Backoff {
                    retry_at: self.backoff_instant(now),
                };
            }
            Err(e) => {
                warn!(schedule_id = %id, error = %e, "Failed to query agent state, assuming idle");
                false
            }
        };

        if !busy {
            return self.start(&record, now).await;
        }

        match interaction {
            TaskInteraction::Interrupt => {
                self.interrupt(id).await;
                self.start(&record, now).await
            }
            TaskInteraction::Skip => {
                debug!(schedule_id = %id, "Agent busy, skipping run");
                self.persist(id, SchedulePatch::default().with_last_skipped_time(now.to_utc()))
                    .await;
                FireOutcome::Skipped
            }
            TaskInteraction::Wait => self.wait(&record, now).await,
        }
    }

    async fn wait(&self, record: &ScheduleRecord, now: DateTime<FixedOffset>) -> FireOutcome {
        let id = &record.id;

        let last_activity = match self.gateway.last_activity_time_for_active_task().await {
            Ok(last_activity) => last_activity,
            Err(e) => {
                warn!(schedule_id = %id, error = %e, "Failed to query task activity");
                return FireOutcome::Backoff {
                    retry_at: self.backoff_instant(now),
                };
            }
        };

        let stalled = last_activity
            .is_some_and(|at| now.to_utc() - at >= record.inactivity_delay());
        if stalled {
            info!(schedule_id = %id, "Active task is idle, interrupting");
            self.interrupt(id).await;
            return self.start(record, now).await;
        }

        let retry_at = self.retry_instant(now);
        debug!(schedule_id = %id, retry_at = %retry_at, "Agent busy, deferring run");
        self.persist(
            id,
            SchedulePatch::default()
                .with_last_skipped_time(now.to_utc())
                .with_next_execution_time(Some(retry_at.to_utc())),
        )
        .await;
        FireOutcome::Deferred { retry_at }
    }

    async fn start(&self, record: &ScheduleRecord, now: DateTime<FixedOffset>) -> FireOutcome {
        let id = &record.id;
        match self
            .gateway
            .start_task(&record.mode, &record.task_instructions)
            .await
        {
            Ok(task_id) => {
                info!(schedule_id = %id, task_id = %task_id, "Started scheduled task");
                self.persist(
                    id,
                    SchedulePatch::default()
                        .with_last_execution_time(now.to_utc())
                        .with_last_task_id(task_id.clone()),
                )
                .await;
                FireOutcome::Started { task_id }
            }
            Err(e) => {
                warn!(schedule_id = %id, error = %e, "Failed to start scheduled task");
                FireOutcome::StartFailed
            }
        }
    }

    async fn has_new_activity(&self, record: &ScheduleRecord) -> bool {
        match self
            .gateway
            .last_activity_time(record.last_task_id.as_ref())
            .await
        {
            Ok(Some(activity)) => record
                .last_execution_time
                .is_none_or(|last_run| activity > last_run),
            Ok(None) => false,
            Err(e) => {
                warn!(schedule_id = %record.id, error = %e, "Failed to query activity");
                false
            }
        }
    }

    async fn interrupt(&self, id: &ScheduleId) {
        if let Err(e) = self.gateway.interrupt_active_task().await {
            warn!(schedule_id = %id, error = %e, "Failed to interrupt active task");
        }
    }

    /// `now + wait_retry`, exact to the second.
    fn backoff_instant(&self, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        now.checked_add_signed(self.wait_retry)
            .unwrap_or_else(|| now + Duration::seconds(DEFAULT_WAIT_RETRY_SECONDS as i64))
    }

    /// The backoff instant with seconds truncated, pushed a minute forward
    /// if truncation lands on or before now.
    fn retry_instant(&self, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let at = self.backoff_instant(now);
        let truncated = at
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(at);
        if truncated <= now {
            truncated + Duration::minutes(1)
        } else {
            truncated
        }
    }

    async fn persist(&self, id: &ScheduleId, patch: SchedulePatch) {
        if let Err(e) = self.store.update_one(id, patch).await {
            warn!(schedule_id = %id, error = %e, "Failed to persist schedule update");
        }
    }
}
