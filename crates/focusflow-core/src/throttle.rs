//! Rate limiting for repeated warnings during extended offline periods.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct LogThrottle {
    interval: Duration,
    last_emitted: Option<DateTime<Utc>>,
    suppressed: u32,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed_since_last)` when a warning may be emitted
    /// at `now`, `None` when it must be swallowed.
    pub fn permit(&mut self, now: DateTime<Utc>) -> Option<u32> {
        match self.last_emitted {
            Some(last) if now - last < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last_emitted = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    /// A success drops the suppressed count. The interval keeps running, so
    /// a flapping connection still warns at most once per interval.
    pub fn recovered(&mut self) {
        self.suppressed = 0;
    }

    /// Forget all history, for a new session.
    pub fn reset(&mut self) {
        self.last_emitted = None;
        self.suppressed = 0;
    }
}
