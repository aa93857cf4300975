//! Time sources.
//!
//! Every "is this order due yet" decision goes through [`BusinessCalendar::today`],
//! never the host clock directly, so tests can pin or advance time.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Pins the clock to noon of `date` in the given business offset.
    pub fn at_business_noon(date: NaiveDate, offset: FixedOffset) -> Self {
        let local = date.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN));
        Self::new(local_to_utc(local, offset))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }

    pub fn advance_days(&self, days: i64) {
        self.advance(Duration::days(days));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn local_to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(local - offset, Utc)
}

/// Supplies "today" in the business timezone.
#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl BusinessCalendar {
    pub fn new(clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self { clock, offset }
    }

    pub fn system(offset: FixedOffset) -> Self {
        Self::new(Arc::new(SystemClock), offset)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn now_local(&self) -> DateTime<FixedOffset> {
        self.clock.now().with_timezone(&self.offset)
    }

    /// Current business date, truncated to midnight in the business offset.
    pub fn today(&self) -> NaiveDate {
        self.now_local().date_naive()
    }

    /// Time left until the next occurrence of `at` in business-local time.
    ///
    /// Returns a full day when `at` is exactly now.
    pub fn until_next(&self, at: NaiveTime) -> std::time::Duration {
        let now = self.now_local().naive_local();
        let mut next = now.date().and_time(at);
        if next <= now {
            next += Duration::days(1);
        }
        (next - now).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn plus7() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    #[test]
    fn today_uses_business_offset_not_utc() {
        // 2024-03-31 20:00 UTC is already April 1st at UTC+7.
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 31, 20, 0, 0).unwrap(),
        ));
        let calendar = BusinessCalendar::new(clock, plus7());
        assert_eq!(calendar.today(), NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
    }

    #[test]
    fn manual_clock_advances() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let clock = Arc::new(ManualClock::at_business_noon(date, plus7()));
        let calendar = BusinessCalendar::new(clock.clone(), plus7());
        assert_eq!(calendar.today(), date);

        clock.advance_days(5);
        assert_eq!(
            calendar.today(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
    }

    #[test]
    fn until_next_wraps_to_tomorrow() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let clock = Arc::new(ManualClock::at_business_noon(date, plus7()));
        let calendar = BusinessCalendar::new(clock, plus7());

        let later = calendar.until_next(NaiveTime::from_hms_opt(13, 0, 0).unwrap());
        assert_eq!(later.as_secs(), 3600);

        let earlier = calendar.until_next(NaiveTime::from_hms_opt(0, 5, 0).unwrap());
        assert_eq!(earlier.as_secs(), 12 * 3600 + 5 * 60);
    }
}
