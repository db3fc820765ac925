//! End-to-end tests for the runtime loop.
//!
//! Drives both engines through [`Runtime`] with an in-memory backend and a
//! manual clock: optimistic creation, automatic completion, stats and
//! route-change reconciliation, mood and break counting, and session
//! teardown (401 and cross-instance logout).

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use focusflow_core::gateway::{Gateway, UserStats, WeeklyData};
use focusflow_core::model::{
    Break, Mood, NewBreak, NewMood, NewTask, Task, TaskCompletion, TaskKind,
};
use focusflow_core::storage::{AuthSession, AuthStore, KvStore, SnapshotSource, SqliteStore};
use focusflow_core::timer::ActiveTaskSnapshot;
use focusflow_core::{
    Config, Counter, Event, EventBus, GatewayError, ManualClock, MemoryStore, Runtime,
    SnapshotStore, UpdateSource,
};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap()
}

fn work(id: &str, start: DateTime<Utc>, minutes: i64) -> Task {
    Task {
        id: id.into(),
        kind: TaskKind::Work,
        start,
        end: start + Duration::minutes(minutes),
        completed: false,
        completed_at: None,
        pomodoro_enabled: true,
        created_at: Some(start - Duration::hours(1)),
    }
}

/// In-memory backend shared by every runtime in a test.
#[derive(Default)]
struct Backend {
    upcoming: Mutex<Vec<Task>>,
    in_progress: Mutex<Option<Task>>,
    moods: Mutex<Vec<Mood>>,
    completed: Mutex<Vec<String>>,
    created: Mutex<u32>,
    reject_auth: Mutex<bool>,
}

impl Backend {
    fn check(&self) -> Result<(), GatewayError> {
        if *self.reject_auth.lock().unwrap() {
            return Err(GatewayError::Unauthorized { status: 401 });
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for Backend {
    async fn list_tasks(&self) -> Result<Vec<Task>, GatewayError> {
        self.check()?;
        Ok(self.upcoming.lock().unwrap().clone())
    }

    async fn upcoming_tasks(&self) -> Result<Vec<Task>, GatewayError> {
        self.check()?;
        Ok(self.upcoming.lock().unwrap().clone())
    }

    async fn create_task(&self, input: &NewTask) -> Result<Task, GatewayError> {
        self.check()?;
        let mut created = self.created.lock().unwrap();
        *created += 1;
        let task = Task {
            id: format!("srv-{created}"),
            kind: input.kind,
            start: input.start,
            end: input.end,
            completed: false,
            completed_at: None,
            pomodoro_enabled: input.pomodoro_enabled,
            created_at: None,
        };
        Ok(task)
    }

    async fn complete_task(
        &self,
        task_id: &str,
        completion: &TaskCompletion,
    ) -> Result<Task, GatewayError> {
        self.check()?;
        self.completed.lock().unwrap().push(task_id.to_string());
        let mut upcoming = self.upcoming.lock().unwrap();
        let task = upcoming
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(GatewayError::Status {
                status: 404,
                body: String::new(),
            })?;
        task.completed = completion.completed;
        task.completed_at = completion.completed_at;
        Ok(task.clone())
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), GatewayError> {
        self.check()?;
        self.upcoming.lock().unwrap().retain(|t| t.id != task_id);
        Ok(())
    }

    async fn list_breaks(&self) -> Result<Vec<Break>, GatewayError> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn create_break(&self, input: &NewBreak) -> Result<Break, GatewayError> {
        self.check()?;
        Ok(Break {
            id: "brk-1".into(),
            kind: input.kind.clone(),
            instant: input.instant.unwrap_or_else(t0),
            duration_minutes: input.duration_minutes,
            feedback: input.feedback.clone(),
        })
    }

    async fn list_moods(&self) -> Result<Vec<Mood>, GatewayError> {
        self.check()?;
        Ok(self.moods.lock().unwrap().clone())
    }

    async fn create_mood(&self, input: &NewMood) -> Result<Mood, GatewayError> {
        self.check()?;
        let mut moods = self.moods.lock().unwrap();
        let mood = Mood {
            id: format!("mood-{}", moods.len() + 1),
            mood_value: input.mood_value,
            stress_value: Some(input.stress_value),
            instant: input.instant,
        };
        moods.push(mood.clone());
        Ok(mood)
    }

    async fn update_mood(&self, mood_id: &str, input: &NewMood) -> Result<Mood, GatewayError> {
        self.check()?;
        let mut moods = self.moods.lock().unwrap();
        let mood = moods
            .iter_mut()
            .find(|m| m.id == mood_id)
            .ok_or(GatewayError::Status {
                status: 404,
                body: String::new(),
            })?;
        mood.mood_value = input.mood_value;
        Ok(mood.clone())
    }

    async fn delete_mood(&self, mood_id: &str) -> Result<(), GatewayError> {
        self.check()?;
        self.moods.lock().unwrap().retain(|m| m.id != mood_id);
        Ok(())
    }

    async fn weekly_data(&self) -> Result<WeeklyData, GatewayError> {
        self.check()?;
        Ok(WeeklyData::default())
    }

    async fn user_stats(&self) -> Result<UserStats, GatewayError> {
        self.check()?;
        Ok(UserStats {
            current_task_in_progress: self.in_progress.lock().unwrap().clone(),
            ..UserStats::default()
        })
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    durable: Arc<MemoryStore>,
    store: SnapshotStore,
    bus: EventBus,
    backend: Arc<Backend>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Harness {
    fn new() -> Self {
        let durable = Arc::new(MemoryStore::new());
        let store = SnapshotStore::new(durable.clone(), Arc::new(MemoryStore::new()));
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        Self {
            clock: Arc::new(ManualClock::new(t0())),
            durable,
            store,
            bus,
            backend: Arc::new(Backend::default()),
            events,
        }
    }

    fn runtime(&self, user_id: &str) -> Runtime {
        Runtime::new(
            user_id,
            self.clock.clone(),
            self.store.clone(),
            self.bus.clone(),
            self.backend.clone(),
            Config::default(),
        )
    }

    fn auth(&self) -> AuthStore {
        let durable: Arc<dyn KvStore> = self.durable.clone();
        AuthStore::new(durable)
    }

    fn active_id(rt: &Runtime) -> Option<String> {
        rt.timer().active_task().map(|t| t.id.clone())
    }

    fn confirmed_completions(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::TaskMarkedCompleted { confirmed: true, .. }))
            .count()
    }
}

// ============================================================================
// Task lifecycle
// ============================================================================

/// Test: an optimistic task is tracked immediately and swapped for the
/// server record once the backend confirms it.
#[tokio::test]
async fn test_created_task_is_tracked_then_confirmed() {
    let h = Harness::new();
    let mut rt = h.runtime("u1");

    let temp = rt
        .create_task(NewTask {
            kind: TaskKind::Work,
            start: t0() - Duration::minutes(1),
            end: t0() + Duration::minutes(24),
            pomodoro_enabled: true,
        })
        .unwrap();
    assert!(temp.is_temporary());

    rt.settle().await;
    let active = rt.timer().active_task().unwrap();
    assert_eq!(active.id, "srv-1");
    assert!(active.created_at.is_some());
    assert_eq!(rt.weekly().aggregate().tasks[6], 1);

    let snapshot = h
        .store
        .load_active(SnapshotSource::UserDurable, "u1")
        .unwrap();
    assert_eq!(snapshot.task.id, "srv-1");
}

/// Test: an inverted range is rejected before anything is published.
#[tokio::test]
async fn test_invalid_task_has_no_side_effects() {
    let h = Harness::new();
    let mut rt = h.runtime("u1");

    let result = rt.create_task(NewTask {
        kind: TaskKind::Work,
        start: t0(),
        end: t0() - Duration::minutes(5),
        pomodoro_enabled: false,
    });
    assert!(result.is_err());
    rt.settle().await;
    assert!(h.events.lock().unwrap().is_empty());
    assert_eq!(rt.in_flight(), 0);
}

/// Test: reaching the end instant completes the task exactly once, also
/// for a fresh instance on the same store.
#[tokio::test]
async fn test_task_completes_once_at_end() {
    let h = Harness::new();
    h.backend
        .upcoming
        .lock()
        .unwrap()
        .push(work("a", t0() - Duration::minutes(24), 25));

    let mut rt = h.runtime("u1");
    rt.start();
    rt.settle().await;
    assert_eq!(rt.timer().active_task().map(|t| t.id.as_str()), Some("a"));

    h.clock.advance(Duration::minutes(2));
    rt.settle().await;
    rt.settle().await;
    assert!(rt.timer().active_task().is_none());
    assert_eq!(*h.backend.completed.lock().unwrap(), vec!["a".to_string()]);
    assert_eq!(h.confirmed_completions(), 1);

    drop(rt);
    let mut restarted = h.runtime("u1");
    restarted.start();
    restarted.settle().await;
    assert_eq!(h.backend.completed.lock().unwrap().len(), 1);
}

/// Test: manual completion before the end instant.
#[tokio::test]
async fn test_manual_completion() {
    let h = Harness::new();
    h.backend
        .upcoming
        .lock()
        .unwrap()
        .push(work("a", t0() - Duration::minutes(5), 25));

    let mut rt = h.runtime("u1");
    rt.start();
    rt.settle().await;
    assert!(rt.complete_task("a"));
    assert!(!rt.complete_task("a"));
    rt.settle().await;

    assert!(rt.timer().active_task().is_none());
    assert_eq!(h.confirmed_completions(), 1);
}

// ============================================================================
// Reconciliation triggers
// ============================================================================

/// Test: the stats poll publishes the in-progress task it reports.
#[tokio::test]
async fn test_stats_poll_publishes_in_progress_task() {
    let h = Harness::new();
    let current = work("now", t0() - Duration::minutes(5), 25);
    h.backend.upcoming.lock().unwrap().push(current.clone());
    *h.backend.in_progress.lock().unwrap() = Some(current);

    let mut rt = h.runtime("u1");
    rt.start();
    rt.settle().await;

    let published = h.events.lock().unwrap().iter().any(|e| {
        matches!(
            e,
            Event::UserStatsUpdated { current_task_in_progress: Some(t) } if t.id == "now"
        )
    });
    assert!(published);
    assert_eq!(Harness::active_id(&rt).as_deref(), Some("now"));
}

/// Test: a stats event carrying an in-progress task replaces a scheduled
/// one.
#[tokio::test]
async fn test_stats_in_progress_task_outranks_scheduled() {
    let h = Harness::new();
    h.backend
        .upcoming
        .lock()
        .unwrap()
        .push(work("later", t0() + Duration::minutes(30), 25));

    let mut rt = h.runtime("u1");
    rt.start();
    rt.settle().await;
    assert_eq!(Harness::active_id(&rt).as_deref(), Some("later"));
    assert!(rt.timer().scheduled_for_future());

    h.bus.publish(Event::UserStatsUpdated {
        current_task_in_progress: Some(work("now", t0() - Duration::minutes(5), 25)),
    });
    rt.settle().await;
    assert_eq!(Harness::active_id(&rt).as_deref(), Some("now"));
    assert!(rt.timer().is_running());
}

/// Test: a route change re-reads a snapshot another process wrote to the
/// shared database, which this instance's change feed never announced.
#[tokio::test]
async fn test_route_change_rereads_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("focusflow.db");
    let ours = SnapshotStore::new(
        Arc::new(SqliteStore::open_at(&path).unwrap()),
        Arc::new(MemoryStore::new()),
    );
    let theirs = SnapshotStore::new(
        Arc::new(SqliteStore::open_at(&path).unwrap()),
        Arc::new(MemoryStore::new()),
    );
    let bus = EventBus::new();
    let mut rt = Runtime::new(
        "u1",
        Arc::new(ManualClock::new(t0())),
        ours,
        bus.clone(),
        Arc::new(Backend::default()),
        Config::default(),
    );
    rt.start();
    rt.settle().await;
    assert!(rt.timer().active_task().is_none());

    let task = work("b", t0() - Duration::minutes(5), 25);
    theirs
        .save_active(&ActiveTaskSnapshot::capture(&task, "u1", t0()))
        .unwrap();
    rt.settle().await;
    assert!(rt.timer().active_task().is_none());

    bus.publish(Event::RouteChanged {
        path: "/dashboard".into(),
    });
    rt.settle().await;
    assert_eq!(Harness::active_id(&rt).as_deref(), Some("b"));
}

// ============================================================================
// Weekly aggregate
// ============================================================================

/// Test: a deleted mood disappears from the count and stays gone after the
/// backend resync.
#[tokio::test]
async fn test_deleted_mood_is_resynced() {
    let h = Harness::new();
    h.backend.moods.lock().unwrap().push(Mood {
        id: "m1".into(),
        mood_value: 3,
        stress_value: Some(2),
        instant: t0() - Duration::hours(1),
    });

    let mut rt = h.runtime("u1");
    rt.start();
    rt.settle().await;
    assert_eq!(rt.weekly().aggregate().moods[6], 1);

    rt.delete_mood("m1");
    assert_eq!(rt.weekly().aggregate().moods[6], 0);
    rt.settle().await;
    assert_eq!(rt.weekly().aggregate().moods[6], 0);
    assert!(rt.weekly().moods().is_empty());
}

/// Test: an added mood is counted once, before and after confirmation.
#[tokio::test]
async fn test_added_mood_counted_once() {
    let h = Harness::new();
    let mut rt = h.runtime("u1");
    rt.start();
    rt.settle().await;

    rt.add_mood(NewMood {
        mood_value: 5,
        stress_value: 1,
        instant: t0(),
    })
    .unwrap();
    rt.settle().await;
    assert_eq!(rt.weekly().aggregate().moods[6], 1);
    assert_eq!(rt.weekly().aggregate().mood_avg[6], Some(5.0));

    assert!(rt
        .add_mood(NewMood {
            mood_value: 9,
            stress_value: 1,
            instant: t0(),
        })
        .is_err());
}

/// Test: a logged break counts at once and outlives a refresh while its
/// delta is fresh.
#[tokio::test]
async fn test_break_counted_optimistically() {
    let h = Harness::new();
    let mut rt = h.runtime("u1");
    rt.start();
    rt.settle().await;

    rt.add_break(NewBreak {
        kind: "short".into(),
        instant: Some(t0()),
        duration_minutes: Some(5),
        feedback: None,
    })
    .unwrap();
    rt.settle().await;
    assert_eq!(rt.weekly().aggregate().breaks[6], 1);
    let optimistic = h.events.lock().unwrap().iter().any(|e| {
        matches!(
            e,
            Event::WeeklyDataUpdated {
                counter: Counter::Break,
                source: UpdateSource::Optimistic,
                ..
            }
        )
    });
    assert!(optimistic);

    h.clock.advance(Duration::seconds(1));
    rt.start_refresh();
    rt.settle().await;
    assert_eq!(rt.weekly().aggregate().breaks[6], 1);
}

// ============================================================================
// Session teardown
// ============================================================================

/// Test: a 401 signs out, clears the session and per-user caches, and
/// stops the loop.
#[tokio::test]
async fn test_unauthorized_tears_down_session() {
    let h = Harness::new();
    let auth = h.auth();
    auth.save(&AuthSession {
        user_id: "u1".into(),
        token: "tok".into(),
    })
    .unwrap();
    h.backend
        .upcoming
        .lock()
        .unwrap()
        .push(work("a", t0() - Duration::minutes(5), 25));
    h.store.record_longest_streak("u1", 4).unwrap();

    let mut rt = h.runtime("u1").with_auth(auth.clone());
    rt.start();
    rt.settle().await;
    assert!(h.store.load_active(SnapshotSource::UserDurable, "u1").is_some());

    *h.backend.reject_auth.lock().unwrap() = true;
    tokio::time::timeout(StdDuration::from_secs(5), rt.run())
        .await
        .expect("runtime should stop after sign-out");

    assert!(rt.signed_out());
    assert!(auth.session().unwrap().is_none());
    assert!(rt.timer().active_task().is_none());
    assert!(h.store.load_active(SnapshotSource::UserDurable, "u1").is_none());
    assert!(h.store.load_active(SnapshotSource::Ephemeral, "u1").is_none());
    assert_eq!(h.store.longest_streak("u1"), 4);
}

/// Test: removing the session from a shared store signs out every
/// instance that uses it.
#[tokio::test]
async fn test_logout_elsewhere_stops_runtime() {
    let h = Harness::new();
    let auth = h.auth();
    auth.save(&AuthSession {
        user_id: "u1".into(),
        token: "tok".into(),
    })
    .unwrap();

    let mut rt = h.runtime("u1").with_auth(auth.clone());
    rt.start();
    rt.settle().await;
    assert!(!rt.signed_out());

    h.auth().clear().unwrap();
    tokio::time::timeout(StdDuration::from_secs(5), rt.run())
        .await
        .expect("runtime should stop after logout elsewhere");
    assert!(rt.signed_out());
}

/// Test: switching users drops the previous session's in-flight results
/// and starts from the new user's own state.
#[tokio::test]
async fn test_user_switch_isolates_state() {
    let h = Harness::new();
    let mut rt = h.runtime("u1");
    rt.create_task(NewTask {
        kind: TaskKind::Work,
        start: t0() - Duration::minutes(1),
        end: t0() + Duration::minutes(24),
        pomodoro_enabled: true,
    })
    .unwrap();
    h.bus.publish(Event::UserLoggedIn {
        user_id: "u2".into(),
    });

    rt.settle().await;
    assert_eq!(rt.user_id(), "u2");
    assert_eq!(rt.in_flight(), 0);
    assert!(rt.timer().active_task().is_none());
    assert_eq!(rt.weekly().aggregate().tasks[6], 0);
    assert!(h.store.load_active(SnapshotSource::UserDurable, "u2").is_none());
}

/// Test: cancellation stops a running loop.
#[tokio::test]
async fn test_cancel_stops_run() {
    let h = Harness::new();
    let mut rt = h.runtime("u1");
    let cancel = rt.cancel_token();
    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), rt.run())
        .await
        .expect("cancelled runtime should return");
    assert!(!rt.signed_out());
}
