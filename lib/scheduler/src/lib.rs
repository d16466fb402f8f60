//! Recurring schedule execution engine.
//!
//! This crate provides:
//!
//! - **Records**: persisted schedules and their validation into a cadence
//! - **Calculator**: the next fire time of a schedule
//! - **Arbiter**: what a firing schedule does when the agent is busy
//! - **Coordinator**: one pending timer per active schedule
//! - **Service**: the loop that drives the coordinator, with a cloneable handle

pub mod arbiter;
pub mod calculate;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod record;
pub mod service;
pub mod store;
mod wire;

pub use arbiter::{FireOutcome, TaskInteractionArbiter};
pub use calculate::{NextExecution, next_execution};
pub use clock::{Clock, SystemClock};
pub use coordinator::{ArmOutcome, TimerCoordinator, TimerEvent, TimerPhase};
pub use error::{RecordError, SchedulerError, StoreError};
pub use gateway::{AgentError, AgentGateway};
pub use record::{Cadence, DayFilter, SchedulePatch, ScheduleRecord, TaskInteraction, TimeUnit};
pub use service::{SchedulerHandle, SchedulerOptions, SchedulerService, SchedulerSnapshot};
pub use store::{LoadReport, ScheduleStore};
