use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::aggregate::WeeklyAggregate;
use crate::events::Counter;

/// Local correction to one day's counter, recorded when the user submits a
/// task or break and honored only while younger than the staleness window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticDelta {
    pub day: NaiveDate,
    pub counter: Counter,
    /// Counter value after the optimistic increment.
    pub value: u32,
    pub created_at: DateTime<Utc>,
}

impl OptimisticDelta {
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.created_at < window
    }
}

/// Record `delta`, replacing any older one for the same day and counter.
pub fn record(deltas: &mut Vec<OptimisticDelta>, delta: OptimisticDelta) {
    deltas.retain(|d| !(d.day == delta.day && d.counter == delta.counter));
    deltas.push(delta);
}

/// Drop deltas that aged out of the window.
pub fn prune(deltas: &mut Vec<OptimisticDelta>, now: DateTime<Utc>, window: Duration) {
    deltas.retain(|d| d.is_fresh(now, window));
}

/// Overlay fresh task and break deltas on server buckets. Mood counts are
/// never overlaid.
pub fn overlay(
    aggregate: &mut WeeklyAggregate,
    deltas: &[OptimisticDelta],
    now: DateTime<Utc>,
    window: Duration,
) -> usize {
    let mut applied = 0;
    for delta in deltas.iter().filter(|d| d.is_fresh(now, window)) {
        if delta.counter == Counter::Mood {
            continue;
        }
        if let Some(i) = aggregate.index_of(delta.day) {
            aggregate.counts_mut(delta.counter)[i] = delta.value;
            applied += 1;
        }
    }
    applied
}
