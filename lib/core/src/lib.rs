//! Core domain types and utilities for cadence.
//!
//! This crate provides the identifier types and error handling shared by the
//! scheduling engine, the agent gateway and the daemon.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ParseIdError, ScheduleId, TaskId};
