//! Injectable time source.
//!
//! All daemons, the queue, and the scheduler take a `Clock` so tests can pin
//! "now" without sleeping.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    fn today_utc(&self) -> NaiveDate {
        self.now_utc().date_naive()
    }

    /// Local calendar date for a route timezone; falls back to UTC when the
    /// zone name is missing or unknown.
    fn today_in(&self, timezone: Option<&str>) -> NaiveDate {
        match timezone.and_then(|name| name.parse::<Tz>().ok()) {
            Some(tz) => self.now_utc().with_timezone(&tz).date_naive(),
            None => self.today_utc(),
        }
    }
}

/// Wall-clock implementation used by the daemons.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Pinned clock for tests.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard += delta;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now_utc(), start);
        clock.advance(chrono::Duration::hours(2));
        assert_eq!(clock.now_utc(), start + chrono::Duration::hours(2));
    }

    #[test]
    fn route_timezone_date() {
        // 03:00 UTC on Feb 2 is still Feb 1 in Denver.
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 2, 2, 3, 0, 0).unwrap());
        assert_eq!(
            clock.today_in(Some("America/Denver")),
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()
        );
        assert_eq!(
            clock.today_in(None),
            NaiveDate::from_ymd_opt(2025, 2, 2).unwrap()
        );
    }
}
