//! Clock and id generation behind a trait so time-dependent logic is
//! testable, plus the fixed-CET day arithmetic used by the daily rate
//! limits.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The daily reset timezone is CET pinned to UTC+1, no DST.
const CET_OFFSET_SECS: i64 = 3600;
const DAY_SECS: i64 = 86400;

/// Wall clock and id source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Day key for a unix timestamp in fixed CET: `floor((unix + 3600) / 86400)`.
pub fn cet_day_key(unix: i64) -> i64 {
    (unix + CET_OFFSET_SECS).div_euclid(DAY_SECS)
}

/// Seconds from `unix` until the next CET midnight.
pub fn secs_until_next_cet_midnight(unix: i64) -> i64 {
    DAY_SECS - (unix + CET_OFFSET_SECS).rem_euclid(DAY_SECS)
}

/// Epoch of the next CET midnight: satisfies `(epoch + 3600) % 86400 == 0`.
pub fn next_cet_midnight_epoch(unix: i64) -> i64 {
    unix + secs_until_next_cet_midnight(unix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_key_rolls_at_cet_midnight() {
        // 22:59:59 UTC = 23:59:59 CET, still the same CET day.
        let before = Utc.with_ymd_and_hms(2024, 3, 1, 22, 59, 59).unwrap();
        // 23:00:00 UTC = 00:00:00 CET next day.
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        assert_eq!(
            cet_day_key(before.timestamp()) + 1,
            cet_day_key(after.timestamp())
        );
    }

    #[test]
    fn next_midnight_epoch_is_aligned() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 56).unwrap();
        let epoch = next_cet_midnight_epoch(now.timestamp());
        assert_eq!((epoch + CET_OFFSET_SECS) % DAY_SECS, 0);
        assert!(epoch > now.timestamp());
        assert!(epoch - now.timestamp() <= DAY_SECS);
    }

    #[test]
    fn seconds_until_midnight_counts_down() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 22, 59, 0).unwrap();
        assert_eq!(secs_until_next_cet_midnight(t.timestamp()), 60);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let before = clock.now();
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now() - before, chrono::Duration::seconds(30));
    }
}
