//! Time source used by the rate limiter and validator.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

/// Wall-clock access plus blocking sleep.
///
/// Day boundaries for the daily request ceiling are taken in the clock's
/// own notion of local time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Block the calling thread.
    fn sleep(&self, duration: Duration);

    /// Start of the local day containing `at`.
    fn day_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        local_midnight(&Local, at.with_timezone(&Local).date_naive()).unwrap_or(at)
    }

    /// Start of the local day after the one containing `at`.
    fn next_day_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.with_timezone(&Local)
            .date_naive()
            .succ_opt()
            .and_then(|day| local_midnight(&Local, day))
            .unwrap_or_else(|| at + chrono::Duration::days(1))
    }
}

/// Midnight of `date` in `tz`, as UTC.
fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The system clock, with days in the machine's local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A manually driven clock for tests and simulations.
///
/// `sleep` advances the clock instead of blocking. Days are UTC days.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        let by = chrono::Duration::from_std(duration)
            .unwrap_or_else(|_| chrono::Duration::days(365_000));
        let mut now = self.now.lock();
        *now = now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    fn day_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        local_midnight(&Utc, at.date_naive()).unwrap_or(at)
    }

    fn next_day_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.day_start(at) + chrono::Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_sleep_advances() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.sleep(Duration::from_millis(1500));
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(1500));

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(3_601_500));
    }

    #[test]
    fn test_manual_clock_days() {
        let clock = ManualClock::new(Utc::now());
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap();
        assert_eq!(clock.day_start(at), Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(clock.next_day_start(at), Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_system_clock_day_bounds_bracket_now() {
        let clock = SystemClock;
        let now = clock.now();
        assert!(clock.day_start(now) <= now);
        assert!(clock.next_day_start(now) > now);
    }
}
