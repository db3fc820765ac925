//! Wall-clock time sources.
//!
//! Every engine reads time through [`Clock`] so tests can drive the state
//! machines deterministically with [`ManualClock`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, Offset, Utc};

/// Wall-clock provider plus the viewer's local UTC offset.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Offset used to map instants onto local calendar days.
    fn offset(&self) -> FixedOffset;

    /// Local calendar date of `now()`.
    fn today(&self) -> NaiveDate {
        local_date(self.now(), self.offset())
    }
}

/// Calendar date of `at` in the given offset.
pub fn local_date(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

/// System clock. The offset is either pinned by configuration or taken from
/// the host's local time zone at each call.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    offset: Option<FixedOffset>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { offset: None }
    }

    pub fn with_offset_minutes(minutes: Option<i32>) -> Self {
        Self {
            offset: minutes.and_then(|m| FixedOffset::east_opt(m * 60)),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
            .unwrap_or_else(|| Local::now().offset().fix())
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<(DateTime<Utc>, FixedOffset)>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_offset(start, Utc.fix())
    }

    pub fn with_offset(start: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            inner: Arc::new(Mutex::new((start, offset))),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.0 = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.0 += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner
            .lock()
            .map(|g| g.0)
            .unwrap_or_else(|p| p.into_inner().0)
    }

    fn offset(&self) -> FixedOffset {
        self.inner
            .lock()
            .map(|g| g.1)
            .unwrap_or_else(|p| p.into_inner().1)
    }
}

/// Never lets observed time move backwards, even when the underlying wall
/// clock is adjusted (NTP step, manual change).
#[derive(Debug, Default)]
pub struct MonotonicGuard {
    last: Option<DateTime<Utc>>,
}

impl MonotonicGuard {
    pub fn observe(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let observed = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(observed);
        observed
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }

    #[test]
    fn today_uses_offset() {
        // 23:30 UTC on June 9 is already June 10 in UTC+2.
        let at = Utc.with_ymd_and_hms(2024, 6, 9, 23, 30, 0).unwrap();
        let clock = ManualClock::with_offset(at, FixedOffset::east_opt(2 * 3600).unwrap());
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 6, 10).unwrap());
    }

    #[test]
    fn monotonic_guard_holds_last_value() {
        let mut guard = MonotonicGuard::default();
        let t = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        assert_eq!(guard.observe(t), t);
        assert_eq!(guard.observe(t - Duration::seconds(5)), t);
        assert_eq!(guard.observe(t + Duration::seconds(1)), t + Duration::seconds(1));
    }
}
