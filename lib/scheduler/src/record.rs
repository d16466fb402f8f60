//! Persisted schedule records.
//!
//! A [`ScheduleRecord`] mirrors one entry of the `schedules` array in the
//! schedules file, field names verbatim. The raw fields are kept loose so that
//! whatever an editor wrote survives a rewrite; [`ScheduleRecord::cadence`]
//! turns them into a typed [`Cadence`] the calculator can work with.

use crate::error::RecordError;
use crate::wire;
use cadence_core::{ScheduleId, TaskId};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The only schedule type this engine executes.
pub const TIME_SCHEDULE_TYPE: &str = "time";

/// Unit of a schedule's repeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// Minutes.
    Minute,
    /// Hours.
    Hour,
    /// Days (24 hours).
    Day,
}

impl TimeUnit {
    /// Parses the persisted unit name.
    pub fn parse(unit: &str) -> Result<Self, RecordError> {
        match unit {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(RecordError::UnknownTimeUnit {
                unit: other.to_string(),
            }),
        }
    }

    /// Returns `count` of this unit as a duration.
    #[must_use]
    pub fn times(self, count: u32) -> Duration {
        let count = i64::from(count);
        match self {
            Self::Minute => Duration::minutes(count),
            Self::Hour => Duration::hours(count),
            Self::Day => Duration::days(count),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minute => write!(f, "minute"),
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
        }
    }
}

/// What to do when a schedule fires while the agent is already busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskInteraction {
    /// Wait for the current task to go idle, retrying shortly.
    #[default]
    Wait,
    /// Cancel the current task and start this one.
    Interrupt,
    /// Skip this occurrence.
    Skip,
}

/// Weekdays on which a schedule may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayFilter {
    days: [bool; 7],
}

impl DayFilter {
    const KEYS: [&'static str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

    /// Builds a filter from the persisted `selectedDays` map.
    ///
    /// Returns `Ok(None)` when no day is selected, meaning every day is
    /// eligible.
    pub fn from_selected(selected: &BTreeMap<String, bool>) -> Result<Option<Self>, RecordError> {
        let mut days = [false; 7];
        for (key, &enabled) in selected {
            let index = Self::KEYS
                .iter()
                .position(|k| k == key)
                .ok_or_else(|| RecordError::UnknownDayKey { key: key.clone() })?;
            days[index] = enabled;
        }
        Ok(days.iter().any(|d| *d).then_some(Self { days }))
    }

    /// Returns whether the given weekday is selected.
    #[must_use]
    pub fn contains(&self, weekday: Weekday) -> bool {
        self.days[weekday.num_days_from_sunday() as usize]
    }
}

/// The validated timing parameters of a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    /// Repeat interval.
    pub interval: Duration,
    /// Day-of-week restriction, `None` for every day.
    pub days: Option<DayFilter>,
    /// Configured start date, if any.
    pub start_date: Option<NaiveDate>,
    /// Configured start hour, used as the time of day on filtered days.
    pub start_hour: u32,
    /// Configured start minute.
    pub start_minute: u32,
    /// Wall-clock instant after which the schedule is retired.
    pub expires_at: Option<NaiveDateTime>,
}

impl Cadence {
    /// Time of day at which runs on a filtered day begin.
    #[must_use]
    pub fn start_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.start_hour, self.start_minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

/// A persisted schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    /// Schedule ID.
    pub id: ScheduleId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Agent mode the task runs in.
    #[serde(default)]
    pub mode: String,
    /// Human-readable mode name, kept for the editor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_display_name: Option<String>,
    /// Instructions sent to the agent.
    #[serde(default)]
    pub task_instructions: String,
    /// Schedule type; absent means time-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_type: Option<String>,
    /// Repeat interval count.
    #[serde(default, with = "wire::numeric_string", skip_serializing_if = "Option::is_none")]
    pub time_interval: Option<u32>,
    /// Repeat interval unit (`minute`, `hour`, `day`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_unit: Option<String>,
    /// Weekday flags keyed `sun` to `sat`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_days: Option<BTreeMap<String, bool>>,
    /// First day of the schedule.
    #[serde(default, with = "wire::optional_date", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, with = "wire::clock_field", skip_serializing_if = "Option::is_none")]
    pub start_hour: Option<u32>,
    #[serde(default, with = "wire::clock_field", skip_serializing_if = "Option::is_none")]
    pub start_minute: Option<u32>,
    /// Last day of the schedule.
    #[serde(default, with = "wire::optional_date", skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<NaiveDate>,
    #[serde(default, with = "wire::clock_field", skip_serializing_if = "Option::is_none")]
    pub expiration_hour: Option<u32>,
    #[serde(default, with = "wire::clock_field", skip_serializing_if = "Option::is_none")]
    pub expiration_minute: Option<u32>,
    /// Only fire when there has been user activity since the last run.
    #[serde(default)]
    pub require_activity: bool,
    /// Whether the schedule is armed.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Busy-agent policy; absent means wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_interaction: Option<TaskInteraction>,
    /// Minutes of idleness after which a busy task counts as stalled.
    #[serde(default, with = "wire::numeric_string", skip_serializing_if = "Option::is_none")]
    pub inactivity_delay: Option<u32>,
    /// When the schedule last started a task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_time: Option<DateTime<Utc>>,
    /// When the schedule last skipped or deferred a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_skipped_time: Option<DateTime<Utc>>,
    /// Cached projection of the next fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution_time: Option<DateTime<Utc>>,
    /// Task started by the last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Fields this engine does not interpret, preserved on rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

/// Default minutes of inactivity before a busy task is treated as stalled.
pub const DEFAULT_INACTIVITY_DELAY_MINUTES: u32 = 1;

impl ScheduleRecord {
    /// Creates an active, time-based record with the given interval.
    #[must_use]
    pub fn new(id: ScheduleId, name: impl Into<String>, interval: u32, unit: TimeUnit) -> Self {
        Self {
            id,
            name: name.into(),
            mode: String::new(),
            mode_display_name: None,
            task_instructions: String::new(),
            schedule_type: Some(TIME_SCHEDULE_TYPE.to_string()),
            time_interval: Some(interval),
            time_unit: Some(unit.to_string()),
            selected_days: None,
            start_date: None,
            start_hour: None,
            start_minute: None,
            expiration_date: None,
            expiration_hour: None,
            expiration_minute: None,
            require_activity: false,
            active: true,
            task_interaction: None,
            inactivity_delay: None,
            last_execution_time: None,
            last_skipped_time: None,
            next_execution_time: None,
            last_task_id: None,
            created_at: None,
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Sets the agent mode and instructions.
    #[must_use]
    pub fn with_task(mut self, mode: impl Into<String>, instructions: impl Into<String>) -> Self {
        self.mode = mode.into();
        self.task_instructions = instructions.into();
        self
    }

    /// Sets the start date and time.
    #[must_use]
    pub fn with_start(mut self, date: NaiveDate, hour: u32, minute: u32) -> Self {
        self.start_date = Some(date);
        self.start_hour = Some(hour);
        self.start_minute = Some(minute);
        self
    }

    /// Sets the expiration date and time.
    #[must_use]
    pub fn with_expiration(mut self, date: NaiveDate, hour: u32, minute: u32) -> Self {
        self.expiration_date = Some(date);
        self.expiration_hour = Some(hour);
        self.expiration_minute = Some(minute);
        self
    }

    /// Restricts the schedule to the given weekdays.
    #[must_use]
    pub fn with_days(mut self, days: &[Weekday]) -> Self {
        let selected = DayFilter::KEYS
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let enabled = days.iter().any(|d| d.num_days_from_sunday() as usize == i);
                ((*key).to_string(), enabled)
            })
            .collect();
        self.selected_days = Some(selected);
        self
    }

    /// Sets the busy-agent policy.
    #[must_use]
    pub fn with_interaction(mut self, interaction: TaskInteraction) -> Self {
        self.task_interaction = Some(interaction);
        self
    }

    /// Returns the busy-agent policy, defaulting to wait.
    #[must_use]
    pub fn interaction(&self) -> TaskInteraction {
        self.task_interaction.unwrap_or_default()
    }

    /// Returns the stall threshold for the wait policy.
    #[must_use]
    pub fn inactivity_delay(&self) -> Duration {
        Duration::minutes(i64::from(
            self.inactivity_delay
                .unwrap_or(DEFAULT_INACTIVITY_DELAY_MINUTES),
        ))
    }

    /// Returns whether this record is a time-based schedule.
    #[must_use]
    pub fn is_time_based(&self) -> bool {
        self.schedule_type
            .as_deref()
            .is_none_or(|t| t.is_empty() || t == TIME_SCHEDULE_TYPE)
    }

    /// Returns the most recent of the last execution and last skip.
    #[must_use]
    pub fn last_activity_marker(&self) -> Option<DateTime<Utc>> {
        match (self.last_execution_time, self.last_skipped_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Returns the wall-clock expiration instant, defaulting to 23:59.
    pub fn expires_at(&self) -> Result<Option<NaiveDateTime>, RecordError> {
        let Some(date) = self.expiration_date else {
            return Ok(None);
        };
        let hour = check_hour("expirationHour", self.expiration_hour.unwrap_or(23))?;
        let minute = check_minute("expirationMinute", self.expiration_minute.unwrap_or(59))?;
        Ok(date.and_hms_opt(hour, minute, 0))
    }

    /// Validates the timing fields.
    pub fn cadence(&self) -> Result<Cadence, RecordError> {
        if !self.is_time_based() {
            return Err(RecordError::UnsupportedScheduleType {
                schedule_type: self.schedule_type.clone().unwrap_or_default(),
            });
        }
        let count = self.time_interval.ok_or(RecordError::MissingInterval)?;
        if count == 0 {
            return Err(RecordError::ZeroInterval);
        }
        let unit = match self.time_unit.as_deref().map(str::trim) {
            None | Some("") => return Err(RecordError::MissingTimeUnit),
            Some(unit) => TimeUnit::parse(unit)?,
        };
        let days = match &self.selected_days {
            Some(selected) => DayFilter::from_selected(selected)?,
            None => None,
        };
        let start_hour = check_hour("startHour", self.start_hour.unwrap_or(0))?;
        let start_minute = check_minute("startMinute", self.start_minute.unwrap_or(0))?;

        Ok(Cadence {
            interval: unit.times(count),
            days,
            start_date: self.start_date,
            start_hour,
            start_minute,
            expires_at: self.expires_at()?,
        })
    }
}

fn check_hour(field: &'static str, value: u32) -> Result<u32, RecordError> {
    if value > 23 {
        return Err(RecordError::HourOutOfRange { field, value });
    }
    Ok(value)
}

fn check_minute(field: &'static str, value: u32) -> Result<u32, RecordError> {
    if value > 59 {
        return Err(RecordError::MinuteOutOfRange { field, value });
    }
    Ok(value)
}

/// A partial update to a [`ScheduleRecord`].
///
/// Fields left as `None` are untouched. Clearable fields take
/// `Some(None)` to remove the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePatch {
    pub name: Option<String>,
    pub mode: Option<String>,
    pub mode_display_name: Option<Option<String>>,
    pub task_instructions: Option<String>,
    pub schedule_type: Option<Option<String>>,
    pub time_interval: Option<Option<u32>>,
    pub time_unit: Option<Option<String>>,
    pub selected_days: Option<Option<BTreeMap<String, bool>>>,
    pub start_date: Option<Option<NaiveDate>>,
    pub start_hour: Option<Option<u32>>,
    pub start_minute: Option<Option<u32>>,
    pub expiration_date: Option<Option<NaiveDate>>,
    pub expiration_hour: Option<Option<u32>>,
    pub expiration_minute: Option<Option<u32>>,
    pub require_activity: Option<bool>,
    pub active: Option<bool>,
    pub task_interaction: Option<Option<TaskInteraction>>,
    pub inactivity_delay: Option<Option<u32>>,
    pub last_execution_time: Option<Option<DateTime<Utc>>>,
    pub last_skipped_time: Option<Option<DateTime<Utc>>>,
    pub next_execution_time: Option<Option<DateTime<Utc>>>,
    pub last_task_id: Option<Option<TaskId>>,
    pub updated_at: Option<Option<DateTime<Utc>>>,
}

impl SchedulePatch {
    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    #[must_use]
    pub fn with_next_execution_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_execution_time = Some(at);
        self
    }

    #[must_use]
    pub fn with_last_execution_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_execution_time = Some(Some(at));
        self
    }

    #[must_use]
    pub fn with_last_skipped_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_skipped_time = Some(Some(at));
        self
    }

    #[must_use]
    pub fn with_last_task_id(mut self, task_id: TaskId) -> Self {
        self.last_task_id = Some(Some(task_id));
        self
    }

    #[must_use]
    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(Some(at));
        self
    }

    /// Returns whether the patch sets nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the patch, returning whether any field changed.
    pub fn apply(self, record: &mut ScheduleRecord) -> bool {
        let mut changed = false;
        changed |= assign(&mut record.name, self.name);
        changed |= assign(&mut record.mode, self.mode);
        changed |= assign(&mut record.mode_display_name, self.mode_display_name);
        changed |= assign(&mut record.task_instructions, self.task_instructions);
        changed |= assign(&mut record.schedule_type, self.schedule_type);
        changed |= assign(&mut record.time_interval, self.time_interval);
        changed |= assign(&mut record.time_unit, self.time_unit);
        changed |= assign(&mut record.selected_days, self.selected_days);
        changed |= assign(&mut record.start_date, self.start_date);
        changed |= assign(&mut record.start_hour, self.start_hour);
        changed |= assign(&mut record.start_minute, self.start_minute);
        changed |= assign(&mut record.expiration_date, self.expiration_date);
        changed |= assign(&mut record.expiration_hour, self.expiration_hour);
        changed |= assign(&mut record.expiration_minute, self.expiration_minute);
        changed |= assign(&mut record.require_activity, self.require_activity);
        changed |= assign(&mut record.active, self.active);
        changed |= assign(&mut record.task_interaction, self.task_interaction);
        changed |= assign(&mut record.inactivity_delay, self.inactivity_delay);
        changed |= assign(&mut record.last_execution_time, self.last_execution_time);
        changed |= assign(&mut record.last_skipped_time, self.last_skipped_time);
        changed |= assign(&mut record.next_execution_time, self.next_execution_time);
        changed |= assign(&mut record.last_task_id, self.last_task_id);
        changed |= assign(&mut record.updated_at, self.updated_at);
        changed
    }
}

fn assign<T: PartialEq>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(value) if *slot != value => {
            *slot = value;
            true
        }
        _ => false,
    }
}
