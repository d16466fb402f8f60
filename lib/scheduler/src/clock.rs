//! Wall-clock source for the scheduler.

use chrono::{DateTime, FixedOffset, Local};

/// Supplies the current wall-clock time.
///
/// Dates and hours in schedule records are interpreted in the offset of the
/// returned value.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<FixedOffset>;
}

/// The system clock in the local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Clock;
    use chrono::{DateTime, FixedOffset, TimeZone};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// A clock pinned to a start time that advances with tokio's clock.
    ///
    /// Under `start_paused` tests the tokio clock only moves when the runtime
    /// auto-advances to the next timer, so wall time and timer deadlines stay
    /// in step.
    pub(crate) struct TokioClock {
        start: DateTime<FixedOffset>,
        origin: Instant,
    }

    impl TokioClock {
        pub(crate) fn starting_at(start: DateTime<FixedOffset>) -> Self {
            Self {
                start,
                origin: Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<FixedOffset> {
            let elapsed = Instant::now().saturating_duration_since(self.origin);
            self.start + chrono::Duration::from_std(elapsed).unwrap_or_default()
        }
    }

    /// A clock that only moves when told to.
    pub(crate) struct ManualClock {
        now: Mutex<DateTime<FixedOffset>>,
    }

    impl ManualClock {
        pub(crate) fn new(now: DateTime<FixedOffset>) -> Self {
            Self {
                now: Mutex::new(now),
            }
        }

        pub(crate) fn set(&self, now: DateTime<FixedOffset>) {
            *self.now.lock().unwrap() = now;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<FixedOffset> {
            *self.now.lock().unwrap()
        }
    }

    /// Builds a UTC-offset timestamp for tests.
    pub(crate) fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_set() {
        let clock = ManualClock::new(at(2025, 3, 14, 10, 0));
        assert_eq!(clock.now(), at(2025, 3, 14, 10, 0));
        clock.set(at(2025, 3, 14, 11, 30));
        assert_eq!(clock.now(), at(2025, 3, 14, 11, 30));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::starting_at(at(2025, 3, 14, 10, 0));
        tokio::time::advance(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now(), at(2025, 3, 14, 10, 1) + chrono::Duration::seconds(30));
    }

    #[test]
    fn system_clock_is_close_to_utc_now() {
        let drift = SystemClock.now().to_utc() - chrono::Utc::now();
        assert!(drift.num_seconds().abs() < 5);
    }
}
