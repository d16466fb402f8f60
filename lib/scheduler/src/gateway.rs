//! Boundary to the external task-execution agent.
//!
//! The scheduler never talks to the agent directly; it goes through an
//! [`AgentGateway`]. `cadence-agent` provides the HTTP implementation.

use async_trait::async_trait;
use cadence_core::TaskId;
use chrono::{DateTime, Utc};
use std::fmt;

/// Errors from the agent gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The agent could not be reached.
    Unavailable { reason: String },
    /// The request failed in transit.
    Transport { reason: String },
    /// The agent refused the request.
    Rejected { status: u16, reason: String },
    /// The agent's response could not be understood.
    InvalidResponse { reason: String },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "agent unavailable: {reason}"),
            Self::Transport { reason } => write!(f, "agent request failed: {reason}"),
            Self::Rejected { status, reason } => {
                write!(f, "agent rejected request with status {status}: {reason}")
            }
            Self::InvalidResponse { reason } => write!(f, "invalid agent response: {reason}"),
        }
    }
}

impl std::error::Error for AgentError {}

/// Operations the scheduler needs from the agent.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Returns whether a task is currently running.
    async fn has_active_task(&self) -> Result<bool, AgentError>;

    /// Returns the most recent activity across tasks, ignoring `excluding`.
    async fn last_activity_time(
        &self,
        excluding: Option<&TaskId>,
    ) -> Result<Option<DateTime<Utc>>, AgentError>;

    /// Returns the last activity of the running task, if any.
    async fn last_activity_time_for_active_task(
        &self,
    ) -> Result<Option<DateTime<Utc>>, AgentError>;

    /// Cancels the running task. Returns whether a task was cancelled.
    async fn interrupt_active_task(&self) -> Result<bool, AgentError>;

    /// Starts a task and returns its ID.
    async fn start_task(&self, mode: &str, instructions: &str) -> Result<TaskId, AgentError>;
}
