//! Error types for the scheduler crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `RecordError`: a schedule record that cannot be turned into a cadence
//! - `StoreError`: failures reading or writing the schedules file
//! - `SchedulerError`: failures talking to the running scheduler service

use cadence_core::ScheduleId;
use std::fmt;
use std::path::PathBuf;

/// Reasons a schedule record is not schedulable.
///
/// These are configuration problems. A record carrying one of them stays in
/// the persisted set but never gets a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Only time-based schedules are executed by this engine.
    UnsupportedScheduleType { schedule_type: String },
    /// No `timeInterval` configured.
    MissingInterval,
    /// `timeInterval` must be positive.
    ZeroInterval,
    /// No `timeUnit` configured.
    MissingTimeUnit,
    /// `timeUnit` is not one of minute, hour or day.
    UnknownTimeUnit { unit: String },
    /// A `selectedDays` key is not a weekday abbreviation.
    UnknownDayKey { key: String },
    /// An hour field is outside 0..=23.
    HourOutOfRange { field: &'static str, value: u32 },
    /// A minute field is outside 0..=59.
    MinuteOutOfRange { field: &'static str, value: u32 },
    /// No weekday within a week satisfies the day filter.
    NoEligibleDay,
    /// The next occurrence falls outside the representable date range.
    IntervalOutOfRange,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedScheduleType { schedule_type } => {
                write!(f, "unsupported schedule type '{schedule_type}'")
            }
            Self::MissingInterval => write!(f, "no time interval configured"),
            Self::ZeroInterval => write!(f, "time interval must be greater than zero"),
            Self::MissingTimeUnit => write!(f, "no time unit configured"),
            Self::UnknownTimeUnit { unit } => write!(f, "unknown time unit '{unit}'"),
            Self::UnknownDayKey { key } => write!(f, "unknown day key '{key}'"),
            Self::HourOutOfRange { field, value } => {
                write!(f, "{field} must be between 0 and 23, got {value}")
            }
            Self::MinuteOutOfRange { field, value } => {
                write!(f, "{field} must be between 0 and 59, got {value}")
            }
            Self::NoEligibleDay => write!(f, "no selected day is eligible"),
            Self::IntervalOutOfRange => {
                write!(f, "next occurrence is outside the supported date range")
            }
        }
    }
}

impl std::error::Error for RecordError {}

/// Errors from schedule storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Reading or writing the schedules file failed.
    Io { path: PathBuf, reason: String },
    /// The schedules file is not valid JSON or lacks a `schedules` array.
    Parse { path: PathBuf, reason: String },
    /// The record set could not be serialized.
    Serialize { reason: String },
    /// No record with the given ID exists.
    NotFound { id: ScheduleId },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, reason } => {
                write!(f, "schedule storage failed at {}: {reason}", path.display())
            }
            Self::Parse { path, reason } => {
                write!(f, "invalid schedules file {}: {reason}", path.display())
            }
            Self::Serialize { reason } => write!(f, "failed to serialize schedules: {reason}"),
            Self::NotFound { id } => write!(f, "schedule not found: {id}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the scheduler service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The service loop has stopped and no longer accepts commands.
    ServiceStopped,
    /// A storage operation failed while handling a command.
    Storage { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceStopped => write!(f, "scheduler service is not running"),
            Self::Storage { reason } => write!(f, "scheduler storage error: {reason}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_error_display() {
        let err = RecordError::UnknownTimeUnit {
            unit: "fortnight".to_string(),
        };
        assert!(err.to_string().contains("fortnight"));
    }

    #[test]
    fn store_error_display_includes_path() {
        let err = StoreError::Parse {
            path: PathBuf::from("/tmp/schedules.json"),
            reason: "expected value".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("/tmp/schedules.json"));
        assert!(display.contains("expected value"));
    }

    #[test]
    fn scheduler_error_display() {
        let err = SchedulerError::ServiceStopped;
        assert!(err.to_string().contains("not running"));
    }
}
