//! Per-schedule timer ownership.
//!
//! The coordinator keeps at most one pending timer per schedule and tracks
//! where each schedule is in its fire cycle. Timers and arbitrations run as
//! spawned tasks and report back through [`TimerEvent`]s; the owner of the
//! coordinator feeds those events into [`TimerCoordinator::handle_event`].

use crate::arbiter::{FireOutcome, TaskInteractionArbiter};
use crate::calculate::{NextExecution, next_execution};
use crate::clock::Clock;
use crate::error::RecordError;
use crate::record::{SchedulePatch, ScheduleRecord};
use crate::store::ScheduleStore;
use cadence_core::ScheduleId;
use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Where a schedule is in its fire cycle. Schedules without a phase are
/// inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Waiting for the regular next run.
    Armed { at: DateTime<FixedOffset> },
    /// Fired; the arbiter is deciding what to do.
    Arbitrating,
    /// Waiting for a short-horizon retry after a deferral.
    AwaitingRetry { at: DateTime<FixedOffset> },
}

/// Messages from timer and arbitration tasks back to the coordinator.
#[derive(Debug, Clone)]
pub enum TimerEvent {
    /// A timer elapsed.
    Fired { id: ScheduleId, generation: u64 },
    /// An arbitration finished.
    Arbitrated {
        id: ScheduleId,
        generation: u64,
        outcome: FireOutcome,
    },
}

/// Result of arming one schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmOutcome {
    /// A timer is pending for the given instant.
    Armed { at: DateTime<FixedOffset> },
    /// The schedule is inactive; any timer was cancelled.
    Inactive,
    /// The schedule expired and was deactivated.
    Expired,
    /// The schedule cannot be scheduled as configured.
    Unschedulable(RecordError),
    /// The schedule is mid-arbitration and will be re-armed when it finishes.
    Arbitrating,
}

struct TimerSlot {
    phase: TimerPhase,
    generation: u64,
    /// Dropping the sender cancels the pending timer.
    cancel: Option<oneshot::Sender<()>>,
}

/// Owns the pending timer of every active schedule.
pub struct TimerCoordinator {
    slots: HashMap<ScheduleId, TimerSlot>,
    next_generation: u64,
    store: ScheduleStore,
    arbiter: TaskInteractionArbiter,
    clock: Arc<dyn Clock>,
    events_tx: mpsc::UnboundedSender<TimerEvent>,
}

impl TimerCoordinator {
    /// Creates a coordinator that reports timer events on `events_tx`.
    #[must_use]
    pub fn new(
        store: ScheduleStore,
        arbiter: TaskInteractionArbiter,
        clock: Arc<dyn Clock>,
        events_tx: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            slots: HashMap::new(),
            next_generation: 0,
            store,
            arbiter,
            clock,
            events_tx,
        }
    }

    /// Cancels every pending timer and arms each record afresh.
    ///
    /// Arbitrations in progress are left to finish; they re-arm their
    /// schedule from the store when done.
    pub async fn reconcile_all(&mut self, records: &[ScheduleRecord]) {
        self.slots
            .retain(|_, slot| slot.phase == TimerPhase::Arbitrating);

        let mut armed = 0;
        for record in records {
            if matches!(self.arm_one(record).await, ArmOutcome::Armed { .. }) {
                armed += 1;
            }
        }
        info!(total = records.len(), armed, "Reconciled schedule timers");
    }

    /// Computes the next run of `record` and arms a timer for it.
    pub async fn arm_one(&mut self, record: &ScheduleRecord) -> ArmOutcome {
        let id = &record.id;
        if self.phase(id) == Some(TimerPhase::Arbitrating) {
            debug!(schedule_id = %id, "Schedule is arbitrating, deferring re-arm");
            return ArmOutcome::Arbitrating;
        }
        if !record.active {
            self.cancel(id);
            return ArmOutcome::Inactive;
        }

        match next_execution(record, self.clock.now()) {
            NextExecution::At(at) => {
                if record.next_execution_time != Some(at.to_utc()) {
                    self.persist(
                        id,
                        SchedulePatch::default().with_next_execution_time(Some(at.to_utc())),
                    )
                    .await;
                }
                self.spawn_timer(id.clone(), at, TimerPhase::Armed { at });
                info!(schedule_id = %id, next_run = %at, "Armed schedule");
                ArmOutcome::Armed { at }
            }
            NextExecution::Expired { at } => {
                self.cancel(id);
                info!(schedule_id = %id, rejected_run = %at, "Schedule expired, deactivating");
                self.persist(
                    id,
                    SchedulePatch::default()
                        .with_active(false)
                        .with_next_execution_time(None),
                )
                .await;
                ArmOutcome::Expired
            }
            NextExecution::Unschedulable(e) => {
                self.cancel(id);
                warn!(schedule_id = %id, error = %e, "Schedule cannot be armed");
                if record.next_execution_time.is_some() {
                    self.persist(id, SchedulePatch::default().with_next_execution_time(None))
                        .await;
                }
                ArmOutcome::Unschedulable(e)
            }
        }
    }

    /// Arms a short-horizon retry for a deferred run.
    pub fn arm_retry(&mut self, id: &ScheduleId, at: DateTime<FixedOffset>) {
        debug!(schedule_id = %id, retry_at = %at, "Armed retry");
        self.spawn_timer(id.clone(), at, TimerPhase::AwaitingRetry { at });
    }

    /// Cancels the pending timer of `id`, if any.
    pub fn cancel(&mut self, id: &ScheduleId) {
        if self.phase(id) == Some(TimerPhase::Arbitrating) {
            return;
        }
        if self.slots.remove(id).is_some() {
            debug!(schedule_id = %id, "Cancelled schedule timer");
        }
    }

    /// Cancels every pending timer.
    pub fn cancel_all(&mut self) {
        self.slots.clear();
    }

    /// Advances the fire cycle in response to a timer or arbitration event.
    pub async fn handle_event(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Fired { id, generation } => self.on_fired(id, generation),
            TimerEvent::Arbitrated {
                id,
                generation,
                outcome,
            } => self.on_arbitrated(id, generation, outcome).await,
        }
    }

    /// Returns the current phase of every schedule with a timer.
    #[must_use]
    pub fn armed(&self) -> HashMap<ScheduleId, TimerPhase> {
        self.slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.phase))
            .collect()
    }

    fn on_fired(&mut self, id: ScheduleId, generation: u64) {
        let Some(slot) = self.slots.get_mut(&id) else {
            debug!(schedule_id = %id, "Ignoring fire for cancelled schedule");
            return;
        };
        if slot.generation != generation || slot.phase == TimerPhase::Arbitrating {
            debug!(schedule_id = %id, generation, "Ignoring stale fire");
            return;
        }

        slot.phase = TimerPhase::Arbitrating;
        slot.cancel = None;
        debug!(schedule_id = %id, "Schedule fired");

        let arbiter = self.arbiter.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = arbiter.arbitrate(&id).await;
            let _ = events_tx.send(TimerEvent::Arbitrated {
                id,
                generation,
                outcome,
            });
        });
    }

    async fn on_arbitrated(&mut self, id: ScheduleId, generation: u64, outcome: FireOutcome) {
        match self.slots.get(&id) {
            Some(slot) if slot.generation == generation && slot.phase == TimerPhase::Arbitrating => {
                self.slots.remove(&id);
            }
            _ => {
                debug!(schedule_id = %id, generation, "Ignoring stale arbitration result");
                return;
            }
        }
        info!(schedule_id = %id, outcome = %outcome, "Schedule run finished");

        let Some(record) = self.store.get(&id).await else {
            debug!(schedule_id = %id, "Schedule removed during arbitration");
            return;
        };
        match outcome.retry_at() {
            Some(at) if record.active => self.arm_retry(&id, at),
            _ => {
                self.arm_one(&record).await;
            }
        }
    }

    fn spawn_timer(&mut self, id: ScheduleId, at: DateTime<FixedOffset>, phase: TimerPhase) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let delay = (at - self.clock.now()).to_std().unwrap_or_default();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        // Replacing the slot drops the previous sender, cancelling its timer.
        self.slots.insert(
            id.clone(),
            TimerSlot {
                phase,
                generation,
                cancel: Some(cancel_tx),
            },
        );

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    let _ = events_tx.send(TimerEvent::Fired { id, generation });
                }
                _ = cancel_rx => {}
            }
        });
    }

    fn phase(&self, id: &ScheduleId) -> Option<TimerPhase> {
        self.slots.get(id).map(|slot| slot.phase)
    }

    async fn persist(&self, id: &ScheduleId, patch: SchedulePatch) {
        if let Err(e) = self.store.update_one(id, patch).await {
            warn!(schedule_id = %id, error = %e, "Failed to persist schedule update");
        }
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

    struct Harness {
        _dir: TempDir,
        store: ScheduleStore,
        agent: Arc<FakeAgent>,
        coordinator: TimerCoordinator,
        events: mpsc::UnboundedReceiver<TimerEvent>,
    }

    async fn harness(records: Vec<ScheduleRecord>, agent: FakeAgent) -> Harness {
        let (dir, store) = seeded(records).await;
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(at(2025, 3, 13, 14, 0)));
        let agent = Arc::new(agent);
        let arbiter = TaskInteractionArbiter::new(agent.clone(), store.clone(), clock.clone());
        let (events_tx, events) = mpsc::unbounded_channel();
        Harness {
            _dir: dir,
            coordinator: TimerCoordinator::new(store.clone(), arbiter, clock, events_tx),
            store,
            agent,
            events,
        }
    }

    impl Harness {
        async fn step(&mut self) -> TimerEvent {
            let event = self.events.recv().await.expect("event");
            self.coordinator.handle_event(event.clone()).await;
            event
        }

        fn phase(&self, id: &ScheduleId) -> Option<TimerPhase> {
            self.coordinator.armed().get(id).copied()
        }
    }

    fn id(s: &str) -> ScheduleId {
        s.parse().unwrap()
    }

    fn quarter_hourly(name: &str) -> ScheduleRecord {
        ScheduleRecord::new(id(name), name, 15, TimeUnit::Minute)
            .with_start(NaiveDate::from_ymd_opt(2025, 3, 13).unwrap(), 9, 0)
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_is_idempotent() {
        let records = vec![quarter_hourly("a")];
        let mut h = harness(records.clone(), FakeAgent::idle()).await;

        h.coordinator.reconcile_all(&records).await;
        let first = h.coordinator.armed();
        let stored = h.store.get(&id("a")).await.unwrap();

        let records = h.store.records().await;
        h.coordinator.reconcile_all(&records).await;
        assert_eq!(h.coordinator.armed(), first);
        assert_eq!(h.store.get(&id("a")).await.unwrap(), stored);
        assert_eq!(first[&id("a")], TimerPhase::Armed { at: at(2025, 3, 13, 14, 15) });

        // Only the surviving timer fires.
        assert!(matches!(h.step().await, TimerEvent::Fired { .. }));
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_starts_task_and_rearms() {
        let records = vec![quarter_hourly("a")];
        let mut h = harness(records.clone(), FakeAgent::idle()).await;
        h.coordinator.reconcile_all(&records).await;

        assert!(matches!(h.step().await, TimerEvent::Fired { .. }));
        assert_eq!(h.phase(&id("a")), Some(TimerPhase::Arbitrating));

        let TimerEvent::Arbitrated { outcome, .. } = h.step().await else {
            panic!("expected arbitration result");
        };
        assert!(matches!(outcome, FireOutcome::Started { .. }));
        assert_eq!(h.agent.started().len(), 1);
        assert_eq!(
            h.phase(&id("a")),
            Some(TimerPhase::Armed { at: at(2025, 3, 13, 14, 30) })
        );

        let stored = h.store.get(&id("a")).await.unwrap();
        assert_eq!(stored.last_execution_time, Some(at(2025, 3, 13, 14, 15).to_utc()));
        assert_eq!(stored.next_execution_time, Some(at(2025, 3, 13, 14, 30).to_utc()));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_agent_defers_to_retry() {
        let mut record = quarter_hourly("a");
        record.inactivity_delay = Some(10);
        // Activity keeps happening at the fire time.
        let agent = FakeAgent::busy_since(at(2025, 3, 13, 14, 12).to_utc());
        let mut h = harness(vec![record.clone()], agent).await;
        h.coordinator.reconcile_all(&[record]).await;

        h.step().await;
        let TimerEvent::Arbitrated { outcome, .. } = h.step().await else {
            panic!("expected arbitration result");
        };
        let retry_at = at(2025, 3, 13, 14, 16);
        assert_eq!(outcome, FireOutcome::Deferred { retry_at });
        assert_eq!(
            h.phase(&id("a")),
            Some(TimerPhase::AwaitingRetry { at: retry_at })
        );
        assert!(h.agent.started().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_record_is_deactivated_when_armed() {
        let record = quarter_hourly("a")
            .with_expiration(NaiveDate::from_ymd_opt(2025, 3, 13).unwrap(), 12, 0);
        let mut h = harness(vec![record.clone()], FakeAgent::idle()).await;

        assert_eq!(h.coordinator.arm_one(&record).await, ArmOutcome::Expired);
        assert_eq!(h.phase(&id("a")), None);
        let stored = h.store.get(&id("a")).await.unwrap();
        assert!(!stored.active);
        assert_eq!(stored.next_execution_time, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unschedulable_record_gets_no_timer() {
        let mut record = quarter_hourly("a");
        record.time_unit = Some("fortnight".to_string());
        let mut h = harness(vec![record.clone()], FakeAgent::idle()).await;

        let outcome = h.coordinator.arm_one(&record).await;
        assert!(matches!(outcome, ArmOutcome::Unschedulable(_)));
        assert!(h.coordinator.armed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pending_timer() {
        let record = quarter_hourly("a");
        let mut h = harness(vec![record.clone()], FakeAgent::idle()).await;
        h.coordinator.arm_one(&record).await;
        h.coordinator.cancel(&id("a"));

        assert!(h.coordinator.armed().is_empty());
        let waited =
            tokio::time::timeout(std::time::Duration::from_secs(3600), h.events.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fire_is_ignored() {
        let record = quarter_hourly("a");
        let mut h = harness(vec![record.clone()], FakeAgent::idle()).await;
        h.coordinator.arm_one(&record).await;

        h.coordinator
            .handle_event(TimerEvent::Fired {
                id: id("a"),
                generation: 999,
            })
            .await;
        assert_eq!(
            h.phase(&id("a")),
            Some(TimerPhase::Armed { at: at(2025, 3, 13, 14, 15) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn arbitrating_record_is_not_rearmed() {
        let record = quarter_hourly("a");
        let mut h = harness(vec![record.clone()], FakeAgent::idle()).await;
        h.coordinator.arm_one(&record).await;
        h.step().await;

        assert_eq!(h.coordinator.arm_one(&record).await, ArmOutcome::Arbitrating);
        h.coordinator.reconcile_all(&[record]).await;
        assert_eq!(h.phase(&id("a")), Some(TimerPhase::Arbitrating));
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_record_cancels_timer() {
        let mut record = quarter_hourly("a");
        let mut h = harness(vec![record.clone()], FakeAgent::idle()).await;
        h.coordinator.arm_one(&record).await;

        record.active = false;
        assert_eq!(h.coordinator.arm_one(&record).await, ArmOutcome::Inactive);
        assert!(h.coordinator.armed().is_empty());
    }
}
