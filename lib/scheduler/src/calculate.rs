//! Next-execution calculation.
//!
//! A pure function of a record and the current time. Wall-clock dates and
//! hours in the record are read in the UTC offset of `now`.

use crate::error::RecordError;
use crate::record::{Cadence, ScheduleRecord};
use chrono::{Datelike, DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Timelike};

/// Result of computing a record's next fire time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextExecution {
    /// The record should fire at this instant, strictly after now.
    At(DateTime<FixedOffset>),
    /// The next occurrence would fall after the record's expiration.
    Expired {
        /// The occurrence that was rejected.
        at: DateTime<FixedOffset>,
    },
    /// The record's configuration cannot produce a fire time.
    Unschedulable(RecordError),
}

/// Computes the next instant at which `record` should fire.
#[must_use]
pub fn next_execution(record: &ScheduleRecord, now: DateTime<FixedOffset>) -> NextExecution {
    let cadence = match record.cadence() {
        Ok(cadence) => cadence,
        Err(e) => return NextExecution::Unschedulable(e),
    };
    match compute(record, &cadence, now) {
        Ok(next) => next,
        Err(e) => NextExecution::Unschedulable(e),
    }
}

fn compute(
    record: &ScheduleRecord,
    cadence: &Cadence,
    now: DateTime<FixedOffset>,
) -> Result<NextExecution, RecordError> {
    let offset = *now.offset();

    let mut candidate = match cadence.start_date {
        Some(date) => {
            let anchor = in_offset(date.and_time(cadence.start_time()), offset)?;
            if anchor > now {
                anchor
            } else {
                advance_past(anchor, now, cadence.interval)?
            }
        }
        None => {
            let reference = record
                .last_activity_marker()
                .map_or(now, |t| t.with_timezone(&offset));
            advance_past(reference, now, cadence.interval)?
        }
    };

    if let Some(days) = cadence.days {
        let mut attempts = 0;
        while !days.contains(candidate.weekday()) {
            if attempts == 7 {
                return Err(RecordError::NoEligibleDay);
            }
            candidate = start_of_next_day(candidate.date_naive(), cadence, offset)?;
            attempts += 1;
        }
    }

    if candidate <= now {
        candidate = recompute_from(now, cadence, offset)?;
    }

    if let Some(expires_at) = cadence.expires_at {
        if candidate > in_offset(expires_at, offset)? {
            return Ok(NextExecution::Expired { at: candidate });
        }
    }

    Ok(NextExecution::At(candidate))
}

/// The first `reference + k * interval` strictly after `now`, seconds
/// truncated and pushed a minute forward if truncation lands on or before now.
fn advance_past(
    reference: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
    interval: Duration,
) -> Result<DateTime<FixedOffset>, RecordError> {
    let interval_ms = interval.num_milliseconds().max(1);
    let elapsed_ms = (now - reference).num_milliseconds();
    let periods = elapsed_ms.div_euclid(interval_ms) + 1;
    let step = periods
        .checked_mul(interval_ms)
        .and_then(Duration::try_milliseconds)
        .ok_or(RecordError::IntervalOutOfRange)?;
    let candidate = truncate_seconds(shift(reference, step)?);
    if candidate <= now {
        shift(candidate, Duration::minutes(1))
    } else {
        Ok(candidate)
    }
}

fn recompute_from(
    now: DateTime<FixedOffset>,
    cadence: &Cadence,
    offset: FixedOffset,
) -> Result<DateTime<FixedOffset>, RecordError> {
    match cadence.days {
        Some(days) => {
            let mut candidate = start_of_next_day(now.date_naive(), cadence, offset)?;
            for _ in 0..7 {
                if days.contains(candidate.weekday()) {
                    break;
                }
                candidate = start_of_next_day(candidate.date_naive(), cadence, offset)?;
            }
            Ok(candidate)
        }
        None => {
            let mut candidate = truncate_seconds(now);
            while candidate <= now {
                candidate = shift(candidate, cadence.interval)?;
            }
            Ok(candidate)
        }
    }
}

fn start_of_next_day(
    date: NaiveDate,
    cadence: &Cadence,
    offset: FixedOffset,
) -> Result<DateTime<FixedOffset>, RecordError> {
    let next = date.succ_opt().ok_or(RecordError::IntervalOutOfRange)?;
    in_offset(next.and_time(cadence.start_time()), offset)
}

fn shift(at: DateTime<FixedOffset>, by: Duration) -> Result<DateTime<FixedOffset>, RecordError> {
    at.checked_add_signed(by).ok_or(RecordError::IntervalOutOfRange)
}

fn truncate_seconds(at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

fn in_offset(
    local: NaiveDateTime,
    offset: FixedOffset,
) -> Result<DateTime<FixedOffset>, RecordError> {
    local
        .checked_sub_signed(Duration::seconds(i64::from(offset.local_minus_utc())))
        .map(|utc| DateTime::from_naive_utc_and_offset(utc, offset))
        .ok_or(RecordError::IntervalOutOfRange)
}
