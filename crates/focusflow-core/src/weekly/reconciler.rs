//! Weekly aggregate reconciler.
//!
//! Blends three sources into the seven-day view: the authoritative server
//! snapshot, short-lived optimistic deltas recorded on local mutations, and
//! the durable last-good snapshot used until the first refresh succeeds.
//!
//! Merge policy, applied in one place ([`WeeklyReconciler::apply_refresh`]):
//! task and break counters take a delta's value over the server's only while
//! the delta is younger than the staleness window. Mood counters always come
//! from the raw mood list.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

use super::aggregate::{WeeklyAggregate, WeeklySnapshot};
use super::delta::{self, OptimisticDelta};
use crate::clock::Clock;
use crate::error::GatewayError;
use crate::events::{Counter, Event, EventBus, UpdateSource};
use crate::gateway::{Gateway, WeeklyData};
use crate::model::{Break, Mood, Task};
use crate::storage::{keys, SnapshotStore, StorageChange, WeeklyConfig};
use crate::throttle::LogThrottle;

/// Everything one refresh reads from the backend.
#[derive(Debug, Clone, Default)]
pub struct RefreshPayload {
    pub weekly: WeeklyData,
    pub tasks: Vec<Task>,
    pub breaks: Vec<Break>,
    pub moods: Vec<Mood>,
}

impl RefreshPayload {
    /// Fetch the weekly snapshot and the raw lists concurrently.
    ///
    /// # Errors
    /// Returns the first gateway error.
    pub async fn fetch(gateway: &dyn Gateway) -> Result<Self, GatewayError> {
        let (weekly, tasks, breaks, moods) = tokio::try_join!(
            gateway.weekly_data(),
            gateway.list_tasks(),
            gateway.list_breaks(),
            gateway.list_moods(),
        )?;
        Ok(Self {
            weekly,
            tasks,
            breaks,
            moods,
        })
    }
}

/// Brief UI highlight after an optimistic change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Highlight {
    pub counter: Counter,
    pub day: NaiveDate,
    pub until: DateTime<Utc>,
}

pub struct WeeklyReconciler {
    user_id: String,
    instance_id: String,
    clock: Arc<dyn Clock>,
    store: SnapshotStore,
    bus: EventBus,
    gateway: Arc<dyn Gateway>,
    staleness_window: Duration,
    refresh_delay: Duration,
    highlight_for: Duration,
    aggregate: WeeklyAggregate,
    captured_at: Option<DateTime<Utc>>,
    deltas: Vec<OptimisticDelta>,
    moods: Vec<Mood>,
    highlight: Option<Highlight>,
    refresh_due: Option<DateTime<Utc>>,
    throttle: LogThrottle,
}

impl WeeklyReconciler {
    pub fn new(
        user_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        store: SnapshotStore,
        bus: EventBus,
        gateway: Arc<dyn Gateway>,
        config: &WeeklyConfig,
    ) -> Self {
        let aggregate = WeeklyAggregate::empty(clock.today());
        Self {
            user_id: user_id.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            clock,
            store,
            bus,
            gateway,
            staleness_window: config.staleness_window(),
            refresh_delay: config.refresh_delay(),
            highlight_for: config.highlight(),
            aggregate,
            captured_at: None,
            deltas: Vec::new(),
            moods: Vec::new(),
            highlight: None,
            refresh_due: None,
            throttle: LogThrottle::new(config.warn_interval()),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn aggregate(&self) -> &WeeklyAggregate {
        &self.aggregate
    }

    pub fn deltas(&self) -> &[OptimisticDelta] {
        &self.deltas
    }

    /// Last authoritative mood list.
    pub fn moods(&self) -> &[Mood] {
        &self.moods
    }

    pub fn gateway(&self) -> Arc<dyn Gateway> {
        Arc::clone(&self.gateway)
    }

    /// The `lastOptimistic` flag; clears itself once its deadline passes.
    pub fn highlight(&self) -> Option<Highlight> {
        let now = self.clock.now();
        self.highlight.filter(|h| now < h.until)
    }

    pub fn refresh_due(&self) -> Option<DateTime<Utc>> {
        self.refresh_due
    }

    /// True once, when a scheduled follow-up refresh has come due.
    pub fn take_due_refresh(&mut self) -> bool {
        match self.refresh_due {
            Some(due) if self.clock.now() >= due => {
                self.refresh_due = None;
                true
            }
            _ => false,
        }
    }

    // ── Restore ──────────────────────────────────────────────────────

    /// Load the newest persisted view for this user, shifted onto today's
    /// window, plus any deltas still inside the staleness window.
    pub fn restore(&mut self) -> bool {
        let durable = self.store.load_weekly(&self.user_id);
        let optimistic = self.store.load_weekly_optimistic(&self.user_id);
        let newest = [durable, optimistic]
            .into_iter()
            .flatten()
            .filter(|s| s.user_id == self.user_id)
            .max_by_key(|s| s.captured_at);

        let now = self.clock.now();
        self.deltas = self.store.load_deltas(&self.user_id);
        delta::prune(&mut self.deltas, now, self.staleness_window);

        let Some(snapshot) = newest else {
            return false;
        };
        let mut aggregate = snapshot.aggregate.realigned(self.clock.today());
        aggregate.recompute_streaks(self.store.longest_streak(&self.user_id));
        debug!(user_id = %self.user_id, captured_at = %snapshot.captured_at, "restored weekly snapshot");
        self.aggregate = aggregate;
        self.captured_at = Some(snapshot.captured_at);
        true
    }

    // ── Refresh ──────────────────────────────────────────────────────

    /// Fetch and apply the authoritative view. A failure leaves the
    /// displayed buckets untouched and is logged at a throttled rate.
    ///
    /// # Errors
    /// Returns the gateway error so the caller can react to auth failures.
    pub async fn refresh(&mut self) -> Result<(), GatewayError> {
        match RefreshPayload::fetch(self.gateway.as_ref()).await {
            Ok(payload) => {
                self.apply_refresh(payload);
                Ok(())
            }
            Err(e) => {
                self.note_refresh_failure(&e);
                Err(e)
            }
        }
    }

    /// Merge a successful refresh into the view and persist it.
    pub fn apply_refresh(&mut self, payload: RefreshPayload) {
        let now = self.clock.now();
        let today = self.clock.today();
        let offset = self.clock.offset();
        let raw = WeeklyAggregate::from_raw(
            today,
            offset,
            &payload.tasks,
            &payload.breaks,
            &payload.moods,
        );

        let mut merged = match WeeklyAggregate::from_server(today, &payload.weekly) {
            Some(server) => {
                if server.tasks != raw.tasks || server.breaks != raw.breaks {
                    debug!(
                        user_id = %self.user_id,
                        server_tasks = ?server.tasks,
                        raw_tasks = ?raw.tasks,
                        "weekly data disagrees with raw lists"
                    );
                }
                server
            }
            None => {
                debug!(user_id = %self.user_id, "weekly data malformed, using raw lists");
                raw.clone()
            }
        };
        merged.moods = raw.moods;
        merged.mood_avg = raw.mood_avg;
        let reported_active = merged.active;
        let reported_longest = merged.streaks.longest;

        delta::prune(&mut self.deltas, now, self.staleness_window);
        let applied = delta::overlay(&mut merged, &self.deltas, now, self.staleness_window);
        merged.mark_activity();
        merged.include_activity(&reported_active);
        self.record_streaks(&mut merged, reported_longest);

        let changed = changed_counters(&self.aggregate, &merged);
        info!(user_id = %self.user_id, applied_deltas = applied, "weekly data refreshed");
        self.aggregate = merged;
        self.moods = payload.moods;
        self.captured_at = Some(now);
        self.refresh_due = None;
        self.throttle.recovered();
        self.persist_durable(now);
        self.persist_deltas();
        for counter in changed {
            self.bus.publish(Event::WeeklyDataUpdated {
                counter,
                date: today,
                source: UpdateSource::Server,
            });
        }
    }

    pub fn note_refresh_failure(&mut self, error: &GatewayError) {
        if let Some(suppressed) = self.throttle.permit(self.clock.now()) {
            warn!(user_id = %self.user_id, error = %error, suppressed, "weekly refresh failed, keeping last view");
        }
    }

    // ── Optimistic updates ───────────────────────────────────────────

    /// Count a new task on the day of `instant`. No-op outside the window.
    pub fn optimistic_add_task(&mut self, instant: DateTime<Utc>) -> bool {
        self.bump(Counter::Task, instant, 1)
    }

    pub fn optimistic_add_break(&mut self, record: &Break) -> bool {
        debug!(kind = %record.kind, minutes = ?record.duration_minutes, "optimistic break");
        self.bump(Counter::Break, record.instant, 1)
    }

    /// Count a mood entry and fold `value` into the day's average.
    pub fn optimistic_add_mood(&mut self, value: i64, instant: DateTime<Utc>) -> bool {
        self.align_to_today();
        let Some(i) = self.aggregate.bucket_index(instant, self.clock.offset()) else {
            return false;
        };
        let n = f64::from(self.aggregate.moods[i]);
        let avg = self.aggregate.mood_avg[i].unwrap_or(0.0);
        self.aggregate.mood_avg[i] = Some((avg * n + value as f64) / (n + 1.0));
        self.bump(Counter::Mood, instant, 1)
    }

    /// Undo a mood count after a deletion, before the server confirms.
    pub fn optimistic_remove_mood(&mut self, instant: DateTime<Utc>) -> bool {
        self.align_to_today();
        let Some(i) = self.aggregate.bucket_index(instant, self.clock.offset()) else {
            return false;
        };
        if self.aggregate.moods[i] == 0 {
            return false;
        }
        if self.aggregate.moods[i] == 1 {
            self.aggregate.mood_avg[i] = None;
        }
        self.bump(Counter::Mood, instant, -1)
    }

    /// Re-derive mood buckets from the backend's mood list.
    ///
    /// # Errors
    /// Returns the gateway error; buckets are left as they were.
    pub async fn sync_mood_counts_from_backend(&mut self) -> Result<(), GatewayError> {
        match self.gateway.list_moods().await {
            Ok(moods) => {
                self.apply_mood_list(moods);
                Ok(())
            }
            Err(e) => {
                self.note_refresh_failure(&e);
                Err(e)
            }
        }
    }

    pub fn apply_mood_list(&mut self, moods: Vec<Mood>) {
        let offset = self.clock.offset();
        let before = self.aggregate.moods;
        self.aggregate.set_moods(&moods, offset);
        self.moods = moods;
        if before != self.aggregate.moods {
            self.aggregate.mark_activity();
            self.recompute_streaks();
            let now = self.clock.now();
            self.persist_durable(now);
            self.bus.publish(Event::WeeklyDataUpdated {
                counter: Counter::Mood,
                date: self.aggregate.today(),
                source: UpdateSource::Server,
            });
        }
    }

    /// Instant of a known mood entry, for bucket lookups on delete.
    pub fn mood_instant(&self, mood_id: &str) -> Option<DateTime<Utc>> {
        self.moods.iter().find(|m| m.id == mood_id).map(|m| m.instant)
    }

    /// Adopt an optimistic view written by another instance.
    pub fn on_storage_change(&mut self, change: &StorageChange) -> bool {
        if change.key == keys::weekly_deltas(&self.user_id) {
            self.deltas = self.store.load_deltas(&self.user_id);
            return false;
        }
        if change.key != keys::weekly_optimistic(&self.user_id) {
            return false;
        }
        let Some(snapshot) = change
            .value
            .as_deref()
            .and_then(|raw| serde_json::from_str::<WeeklySnapshot>(raw).ok())
        else {
            return false;
        };
        if snapshot.user_id != self.user_id
            || snapshot.writer.as_deref() == Some(self.instance_id.as_str())
            || self.captured_at.is_some_and(|at| at >= snapshot.captured_at)
        {
            return false;
        }
        let changed = changed_counters(&self.aggregate, &snapshot.aggregate);
        self.aggregate = snapshot.aggregate.realigned(self.clock.today());
        self.captured_at = Some(snapshot.captured_at);
        for counter in changed {
            self.bus.publish(Event::WeeklyDataUpdated {
                counter,
                date: self.aggregate.today(),
                source: UpdateSource::Storage,
            });
        }
        true
    }

    /// Forget in-memory state; persisted entries are cleared by the session
    /// owner.
    pub fn reset(&mut self) {
        self.aggregate = WeeklyAggregate::empty(self.clock.today());
        self.captured_at = None;
        self.deltas.clear();
        self.moods.clear();
        self.highlight = None;
        self.refresh_due = None;
        self.throttle.reset();
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn bump(&mut self, counter: Counter, instant: DateTime<Utc>, by: i32) -> bool {
        let now = self.clock.now();
        self.align_to_today();
        let Some(i) = self.aggregate.bucket_index(instant, self.clock.offset()) else {
            debug!(?counter, %instant, "instant outside weekly window, ignoring");
            return false;
        };
        let day = self.aggregate.days[i];
        let slot = &mut self.aggregate.counts_mut(counter)[i];
        *slot = slot.saturating_add_signed(by);
        let value = *slot;

        if counter != Counter::Mood {
            delta::record(
                &mut self.deltas,
                OptimisticDelta {
                    day,
                    counter,
                    value,
                    created_at: now,
                },
            );
        }
        self.aggregate.mark_activity();
        self.recompute_streaks();
        self.captured_at = Some(now);
        self.highlight = Some(Highlight {
            counter,
            day,
            until: now + self.highlight_for,
        });
        self.refresh_due = Some(now + self.refresh_delay);
        self.persist_optimistic(now);
        self.persist_deltas();
        self.bus.publish(Event::WeeklyDataUpdated {
            counter,
            date: day,
            source: UpdateSource::Optimistic,
        });
        true
    }

    fn align_to_today(&mut self) {
        let today = self.clock.today();
        if self.aggregate.today() != today {
            self.aggregate = self.aggregate.realigned(today);
        }
    }

    /// Streaks for locally changed counters. The durable maximum is only
    /// raised from server data.
    fn recompute_streaks(&mut self) {
        let remembered = self.store.longest_streak(&self.user_id);
        self.aggregate.recompute_streaks(remembered);
    }

    fn record_streaks(&self, aggregate: &mut WeeklyAggregate, reported_longest: u32) {
        let remembered = self.store.longest_streak(&self.user_id);
        aggregate.recompute_streaks(remembered.max(reported_longest));
        match self
            .store
            .record_longest_streak(&self.user_id, aggregate.streaks.longest)
        {
            Ok(longest) => aggregate.streaks.longest = longest,
            Err(e) => debug!(error = %e, "failed to record longest streak"),
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> WeeklySnapshot {
        WeeklySnapshot {
            user_id: self.user_id.clone(),
            captured_at: now,
            aggregate: self.aggregate.clone(),
            writer: Some(self.instance_id.clone()),
        }
    }

    fn persist_durable(&self, now: DateTime<Utc>) {
        if let Err(e) = self.store.save_weekly(&self.snapshot(now)) {
            debug!(error = %e, "failed to persist weekly snapshot");
        }
    }

    fn persist_optimistic(&self, now: DateTime<Utc>) {
        if let Err(e) = self.store.save_weekly_optimistic(&self.snapshot(now)) {
            debug!(error = %e, "failed to persist optimistic weekly snapshot");
        }
    }

    fn persist_deltas(&self) {
        if let Err(e) = self.store.save_deltas(&self.user_id, &self.deltas) {
            debug!(error = %e, "failed to persist optimistic deltas");
        }
    }
}

fn changed_counters(before: &WeeklyAggregate, after: &WeeklyAggregate) -> Vec<Counter> {
    let realigned = before.days != after.days;
    [Counter::Task, Counter::Break, Counter::Mood]
        .into_iter()
        .filter(|c| realigned || before.counts(*c) != after.counts(*c))
        .collect()
}
