//! Seven-day rolling buckets, oldest first, index 6 is today in the
//! viewer's local time zone.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::streak::{compute_streaks, Streaks};
use crate::clock::local_date;
use crate::events::Counter;
use crate::gateway::WeeklyData;
use crate::model::{Break, Mood, Task};

/// Number of buckets in the window.
pub const DAYS: usize = 7;

/// Calendar dates covered by the window ending on `today`, oldest first.
pub fn window(today: NaiveDate) -> [NaiveDate; DAYS] {
    let mut days = [today; DAYS];
    for (i, day) in days.iter_mut().enumerate() {
        let back = (DAYS - 1 - i) as u64;
        *day = today.checked_sub_days(Days::new(back)).unwrap_or(today);
    }
    days
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyAggregate {
    pub days: [NaiveDate; DAYS],
    pub tasks: [u32; DAYS],
    pub breaks: [u32; DAYS],
    pub moods: [u32; DAYS],
    pub mood_avg: [Option<f64>; DAYS],
    /// Per-day "had qualifying activity" flags feeding the streaks.
    pub active: [bool; DAYS],
    #[serde(default)]
    pub streaks: Streaks,
}

impl WeeklyAggregate {
    pub fn empty(today: NaiveDate) -> Self {
        Self {
            days: window(today),
            tasks: [0; DAYS],
            breaks: [0; DAYS],
            moods: [0; DAYS],
            mood_avg: [None; DAYS],
            active: [false; DAYS],
            streaks: Streaks::default(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.days[DAYS - 1]
    }

    /// Bucket holding `date`, if it falls inside the window.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.days.iter().position(|d| *d == date)
    }

    /// Bucket holding `instant` as seen at `offset`.
    pub fn bucket_index(&self, instant: DateTime<Utc>, offset: FixedOffset) -> Option<usize> {
        self.index_of(local_date(instant, offset))
    }

    pub fn counts(&self, counter: Counter) -> &[u32; DAYS] {
        match counter {
            Counter::Task => &self.tasks,
            Counter::Break => &self.breaks,
            Counter::Mood => &self.moods,
        }
    }

    pub fn counts_mut(&mut self, counter: Counter) -> &mut [u32; DAYS] {
        match counter {
            Counter::Task => &mut self.tasks,
            Counter::Break => &mut self.breaks,
            Counter::Mood => &mut self.moods,
        }
    }

    /// Buckets computed from raw backend lists. Tasks count on their start
    /// date, breaks and moods on their instant.
    pub fn from_raw(
        today: NaiveDate,
        offset: FixedOffset,
        tasks: &[Task],
        breaks: &[Break],
        moods: &[Mood],
    ) -> Self {
        let mut agg = Self::empty(today);
        for task in tasks {
            if let Some(i) = agg.bucket_index(task.start, offset) {
                agg.tasks[i] += 1;
            }
        }
        for record in breaks {
            if let Some(i) = agg.bucket_index(record.instant, offset) {
                agg.breaks[i] += 1;
            }
        }
        agg.set_moods(moods, offset);
        agg.mark_activity();
        agg
    }

    /// Authoritative buckets from the weekly-data endpoint. `None` when the
    /// task or break arrays are not seven entries long.
    pub fn from_server(today: NaiveDate, data: &WeeklyData) -> Option<Self> {
        let tasks: [u32; DAYS] = data.tasks_per_day.as_slice().try_into().ok()?;
        let breaks: [u32; DAYS] = data.breaks_per_day.as_slice().try_into().ok()?;
        let mut agg = Self::empty(today);
        agg.tasks = tasks;
        agg.breaks = breaks;
        if let Ok(moods) = <[u32; DAYS]>::try_from(data.mood_counts_per_day.as_slice()) {
            agg.moods = moods;
        }
        if let Ok(avg) = <[Option<f64>; DAYS]>::try_from(data.mood_avg_per_day.as_slice()) {
            agg.mood_avg = avg;
        }
        if let Ok(active) = <[bool; DAYS]>::try_from(data.streak_data.as_slice()) {
            agg.active = active;
        }
        agg.streaks = Streaks {
            current: data.current_streak,
            longest: data.longest_streak,
        };
        Some(agg)
    }

    /// Replace mood counts and averages with values derived from `moods`.
    pub fn set_moods(&mut self, moods: &[Mood], offset: FixedOffset) {
        let mut sums = [0i64; DAYS];
        self.moods = [0; DAYS];
        for mood in moods {
            if let Some(i) = self.bucket_index(mood.instant, offset) {
                self.moods[i] += 1;
                sums[i] += mood.mood_value;
            }
        }
        for i in 0..DAYS {
            self.mood_avg[i] = (self.moods[i] > 0).then(|| sums[i] as f64 / f64::from(self.moods[i]));
        }
    }

    /// Rebuild the activity flags from the counters: a day with any task,
    /// break or mood entry is active, every other day is not.
    pub fn mark_activity(&mut self) {
        for i in 0..DAYS {
            self.active[i] = self.tasks[i] > 0 || self.breaks[i] > 0 || self.moods[i] > 0;
        }
    }

    /// Fold in days the server reported as active.
    pub fn include_activity(&mut self, reported: &[bool; DAYS]) {
        for (active, reported) in self.active.iter_mut().zip(reported) {
            *active |= *reported;
        }
    }

    /// Recompute streaks from the activity flags, never dropping the
    /// longest streak below `remembered_longest`.
    pub fn recompute_streaks(&mut self, remembered_longest: u32) {
        self.streaks = compute_streaks(&self.active, remembered_longest);
    }

    /// Shift onto the window ending `today`. Days that fell out are dropped,
    /// new days start empty.
    pub fn realigned(&self, today: NaiveDate) -> Self {
        if self.today() == today {
            return self.clone();
        }
        let mut agg = Self::empty(today);
        for (new_i, day) in agg.days.into_iter().enumerate() {
            if let Some(old_i) = self.index_of(day) {
                agg.tasks[new_i] = self.tasks[old_i];
                agg.breaks[new_i] = self.breaks[old_i];
                agg.moods[new_i] = self.moods[old_i];
                agg.mood_avg[new_i] = self.mood_avg[old_i];
                agg.active[new_i] = self.active[old_i];
            }
        }
        debug!(from = %self.today(), to = %today, "realigned weekly window");
        agg.recompute_streaks(self.streaks.longest);
        agg
    }
}

/// Persisted weekly view with its capture instant and owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklySnapshot {
    pub user_id: String,
    pub captured_at: DateTime<Utc>,
    pub aggregate: WeeklyAggregate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<String>,
}
