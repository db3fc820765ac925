//! Tests for the timer engine.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use proptest::prelude::*;

    use super::super::engine::*;
    use super::super::snapshot::ActiveTaskSnapshot;
    use crate::clock::ManualClock;
    use crate::events::{Event, EventBus};
    use crate::model::{NewTask, TaskKind, TaskPhase};
    use crate::storage::{keys, SnapshotSource, SnapshotStore};
    use crate::test_support::*;

    fn engine_for(
        user: &str,
        clock: &Arc<ManualClock>,
        store: &SnapshotStore,
        bus: &EventBus,
        gateway: &Arc<FakeGateway>,
    ) -> TaskTimerEngine {
        TaskTimerEngine::new(
            user,
            clock.clone(),
            store.clone(),
            bus.clone(),
            gateway.clone(),
            Duration::seconds(60),
        )
    }

    fn completions(events: &[Event], confirmed: bool) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::TaskMarkedCompleted { confirmed: c, .. } if *c == confirmed))
            .count()
    }

    proptest! {
        #[test]
        fn progress_never_decreases(steps in proptest::collection::vec(-5_000i64..90_000, 1..60)) {
            let clock = clock();
            let bus = EventBus::new();
            let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
            engine.set_active_task(Some(task("t1", t0() + Duration::seconds(30), 25)));

            let mut last_progress = engine.progress();
            let mut last_phase = engine.phase();
            for step in steps {
                clock.advance(Duration::milliseconds(step));
                engine.tick();
                if engine.active_task().is_none() {
                    break;
                }
                prop_assert!(engine.progress() >= last_progress);
                prop_assert!((0.0..=100.0).contains(&engine.progress()));
                prop_assert!(engine.phase() >= last_phase);
                last_progress = engine.progress();
                last_phase = engine.phase();
            }
        }
    }

    #[test]
    fn phases_advance_with_clock() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("t1", t0() + Duration::minutes(5), 10)));
        assert!(engine.scheduled_for_future());
        assert_eq!(engine.progress(), 0.0);

        clock.advance(Duration::minutes(10));
        engine.tick();
        assert!(engine.is_running());
        assert_eq!(engine.progress(), 50.0);
    }

    #[test]
    fn clock_rollback_does_not_rewind_progress() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("t1", t0(), 10)));
        clock.advance(Duration::minutes(5));
        engine.tick();
        clock.advance(Duration::minutes(-3));
        engine.tick();
        assert_eq!(engine.progress(), 50.0);
    }

    #[test]
    fn expired_task_is_never_tracked() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let mut engine = engine_for("u1", &clock, &store, &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("old", t0() - Duration::hours(1), 10)));
        assert!(engine.active_task().is_none());
        assert!(store.load_active(SnapshotSource::UserDurable, "u1").is_none());
    }

    #[test]
    fn completion_fires_exactly_once() {
        let clock = clock();
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let store = stores();
        let mut engine = engine_for("u1", &clock, &store, &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("t1", t0(), 1)));

        clock.advance(Duration::minutes(2));
        let request = engine.tick().expect("completion request");
        assert_eq!(request.task.id, "t1");
        assert!(request.body().completed);
        assert!(engine.tick().is_none());
        assert!(engine.active_task().is_none());
        assert_eq!(completions(&seen.lock().unwrap(), false), 1);
        assert_eq!(store.completion_guard("u1").as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn completion_guard_survives_restart() {
        let clock = clock();
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let store = stores();
        let gateway = FakeGateway::new();
        let running = task("t1", t0() - Duration::minutes(1), 25);
        gateway.upcoming.lock().unwrap().push(running.clone());

        let mut first = engine_for("u1", &clock, &store, &bus, &gateway);
        first.set_active_task(Some(running.clone()));
        first.mark_task_completed("t1").await.unwrap();
        assert_eq!(completions(&seen.lock().unwrap(), false), 1);
        assert_eq!(completions(&seen.lock().unwrap(), true), 1);
        drop(first);

        // Backend has not caught up yet and still lists the task.
        let mut second = engine_for("u1", &clock, &store, &bus, &gateway);
        assert!(!second.reconcile(Some(running), ReconcileSource::Poll));
        assert_eq!(second.restore(), RestoreOutcome::NeedsLookup);
        clock.advance(Duration::minutes(30));
        assert!(second.tick().is_none());
        assert_eq!(completions(&seen.lock().unwrap(), false), 1);
    }

    #[tokio::test]
    async fn failed_completion_keeps_optimistic_state() {
        let clock = clock();
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let gateway = FakeGateway::new();
        gateway.fail(Some(network_down));
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &gateway);
        engine.set_active_task(Some(task("t1", t0(), 25)));

        assert!(engine.mark_task_completed("t1").await.is_ok());
        assert!(engine.active_task().is_none());
        assert_eq!(completions(&seen.lock().unwrap(), false), 1);
        assert_eq!(completions(&seen.lock().unwrap(), true), 0);
    }

    #[test]
    fn auth_failure_on_completion_is_returned() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        let request = CompletionRequest {
            task: task("t1", t0(), 1),
            completed_at: t0(),
        };
        let err = engine
            .apply_completion_result(&request, Err(unauthorized()))
            .unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[test]
    fn snapshot_restores_in_new_instance() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let gateway = FakeGateway::new();
        let mut first = engine_for("u1", &clock, &store, &bus, &gateway);
        first.set_active_task(Some(task("t1", t0() - Duration::minutes(5), 10)));

        let mut second = engine_for("u1", &clock, &store, &bus, &gateway);
        assert_eq!(
            second.restore(),
            RestoreOutcome::Restored(SnapshotSource::UserDurable)
        );
        assert_eq!(second.active_task().map(|t| t.id.as_str()), Some("t1"));
        assert!(second.is_running());
        assert_eq!(second.progress(), 50.0);
    }

    #[test]
    fn ephemeral_snapshot_used_when_durable_missing() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let gateway = FakeGateway::new();
        let mut first = engine_for("u1", &clock, &store, &bus, &gateway);
        first.set_active_task(Some(task("t1", t0(), 10)));
        store.durable().remove(&keys::active_task("u1")).unwrap();

        let mut second = engine_for("u1", &clock, &store, &bus, &gateway);
        assert_eq!(
            second.restore(),
            RestoreOutcome::Restored(SnapshotSource::Ephemeral)
        );
    }

    #[test]
    fn expired_snapshot_is_discarded_on_restore() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let gateway = FakeGateway::new();
        let mut first = engine_for("u1", &clock, &store, &bus, &gateway);
        first.set_active_task(Some(task("t1", t0(), 10)));
        drop(first);

        clock.advance(Duration::minutes(11));
        let mut second = engine_for("u1", &clock, &store, &bus, &gateway);
        assert_eq!(second.restore(), RestoreOutcome::NeedsLookup);
        assert!(second.active_task().is_none());
        assert!(store.load_active(SnapshotSource::UserDurable, "u1").is_none());
        assert!(store.load_active(SnapshotSource::Ephemeral, "u1").is_none());
    }

    #[test]
    fn snapshots_are_isolated_per_user() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let gateway = FakeGateway::new();
        let mut alice = engine_for("alice", &clock, &store, &bus, &gateway);
        alice.set_active_task(Some(task("a1", t0(), 10)));

        let mut bob = engine_for("bob", &clock, &store, &bus, &gateway);
        assert_eq!(bob.restore(), RestoreOutcome::NeedsLookup);
        assert!(bob.active_task().is_none());
        assert!(store.load_active(SnapshotSource::UserDurable, "alice").is_some());
    }

    #[test]
    fn legacy_snapshot_is_migrated_for_its_owner_only() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let gateway = FakeGateway::new();
        let legacy = ActiveTaskSnapshot::capture(&task("t1", t0(), 10), "alice", t0());
        store
            .durable()
            .set(keys::LEGACY_ACTIVE_TASK, &serde_json::to_string(&legacy).unwrap())
            .unwrap();

        let mut bob = engine_for("bob", &clock, &store, &bus, &gateway);
        assert_eq!(bob.restore(), RestoreOutcome::NeedsLookup);
        assert!(store.load_active(SnapshotSource::LegacyDurable, "bob").is_some());

        let mut alice = engine_for("alice", &clock, &store, &bus, &gateway);
        assert_eq!(
            alice.restore(),
            RestoreOutcome::Restored(SnapshotSource::LegacyDurable)
        );
        assert!(store.load_active(SnapshotSource::LegacyDurable, "alice").is_none());
        let migrated = store
            .load_active(SnapshotSource::UserDurable, "alice")
            .unwrap();
        assert_eq!(migrated.task.id, "t1");
    }

    #[test]
    fn in_progress_beats_scheduled() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("later", t0() + Duration::minutes(30), 25)));

        let running = task("now", t0() - Duration::minutes(1), 25);
        assert!(engine.reconcile(Some(running), ReconcileSource::Event));
        assert_eq!(engine.active_task().unwrap().id, "now");

        let mut newer_but_scheduled = task("next", t0() + Duration::minutes(5), 25);
        newer_but_scheduled.created_at = Some(t0());
        assert!(!engine.reconcile(Some(newer_but_scheduled), ReconcileSource::Event));
        assert_eq!(engine.active_task().unwrap().id, "now");
    }

    #[test]
    fn poll_prefers_earlier_start() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("b", t0() + Duration::minutes(30), 25)));
        let earlier = task("a", t0() + Duration::minutes(10), 10);
        assert!(engine.reconcile(Some(earlier), ReconcileSource::Poll));
        assert_eq!(engine.active_task().unwrap().id, "a");
    }

    #[test]
    fn event_prefers_most_recently_created() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        let current = task("a", t0() + Duration::minutes(10), 10);
        engine.set_active_task(Some(current.clone()));

        let mut tie = task("b", t0() + Duration::minutes(40), 10);
        tie.created_at = current.created_at;
        assert!(!engine.reconcile(Some(tie.clone()), ReconcileSource::Event));

        tie.created_at = Some(t0());
        assert!(engine.reconcile(Some(tie), ReconcileSource::Event));
        assert_eq!(engine.active_task().unwrap().id, "b");
    }

    #[test]
    fn reconcile_is_idempotent() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        let t = task("t1", t0(), 10);
        assert!(engine.reconcile(Some(t.clone()), ReconcileSource::Poll));
        assert!(!engine.reconcile(Some(t.clone()), ReconcileSource::Poll));
        assert!(!engine.reconcile(Some(t), ReconcileSource::Storage));
        assert!(!engine.reconcile(None, ReconcileSource::Poll));
        assert_eq!(engine.active_task().unwrap().id, "t1");
    }

    #[test]
    fn reconcile_fires_completion_for_expired_active_task() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("t1", t0(), 1)));
        clock.advance(Duration::minutes(5));

        let next = task("t2", t0() + Duration::minutes(10), 10);
        assert!(engine.reconcile(Some(next), ReconcileSource::Poll));
        let pending = engine.drain_completions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task.id, "t1");
        assert!(engine.drain_completions().is_empty());
    }

    #[test]
    fn deleting_active_task_clears_snapshot() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let mut engine = engine_for("u1", &clock, &store, &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("t1", t0(), 10)));
        assert!(!engine.on_task_deleted("other"));
        assert!(engine.on_task_deleted("t1"));
        assert!(engine.active_task().is_none());
        assert!(store.load_active(SnapshotSource::UserDurable, "u1").is_none());
    }

    #[test]
    fn temporary_id_is_replaced_on_confirmation() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let mut engine = engine_for("u1", &clock, &store, &bus, &FakeGateway::new());
        let input = NewTask {
            kind: TaskKind::Work,
            start: t0() - Duration::minutes(5),
            end: t0() + Duration::minutes(5),
            pomodoro_enabled: true,
        };
        let temp = input.to_temporary(t0());
        let temp_id = temp.id.clone();
        engine.set_active_task(Some(temp.clone()));

        let mut server = temp;
        server.id = "srv-1".into();
        server.created_at = None;
        engine.confirm_task_id(&temp_id, server);

        let active = engine.active_task().unwrap();
        assert_eq!(active.id, "srv-1");
        assert_eq!(active.created_at, Some(t0()));
        assert_eq!(engine.phase(), Some(TaskPhase::InProgress));
        let saved = store.load_active(SnapshotSource::UserDurable, "u1").unwrap();
        assert_eq!(saved.task.id, "srv-1");
    }

    #[test]
    fn storage_change_from_other_instance_is_adopted() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let gateway = FakeGateway::new();
        let mut rx = store.durable().changes();
        let mut writer = engine_for("u1", &clock, &store, &bus, &gateway);
        let mut reader = engine_for("u1", &clock, &store, &bus, &gateway);

        writer.set_active_task(Some(task("t1", t0(), 10)));
        let change = rx.try_recv().unwrap();
        assert_eq!(writer.on_storage_change(&change), StorageOutcome::Ignored);
        assert_eq!(reader.on_storage_change(&change), StorageOutcome::Adopted);
        assert_eq!(reader.active_task().unwrap().id, "t1");

        writer.on_task_deleted("t1");
        let cleared = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|c| c.value.is_none())
            .unwrap();
        assert_eq!(reader.on_storage_change(&cleared), StorageOutcome::NeedsLookup);
    }

    #[test]
    fn storage_change_for_other_user_is_ignored() {
        let clock = clock();
        let bus = EventBus::new();
        let store = stores();
        let gateway = FakeGateway::new();
        let mut rx = store.durable().changes();
        let mut alice = engine_for("alice", &clock, &store, &bus, &gateway);
        let mut bob = engine_for("bob", &clock, &store, &bus, &gateway);
        alice.set_active_task(Some(task("a1", t0(), 10)));
        let change = rx.try_recv().unwrap();
        assert_eq!(bob.on_storage_change(&change), StorageOutcome::Ignored);
        assert!(bob.active_task().is_none());
    }

    #[tokio::test]
    async fn restore_falls_back_to_backend_lookup() {
        let clock = clock();
        let bus = EventBus::new();
        let gateway = FakeGateway::new();
        gateway.upcoming.lock().unwrap().extend([
            task("late", t0() + Duration::hours(2), 25),
            task("done", t0() - Duration::hours(2), 25),
            task("soon", t0() + Duration::minutes(15), 25),
        ]);
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &gateway);
        let active = engine.restore_or_lookup().await.unwrap();
        assert_eq!(active.map(|t| t.id.as_str()), Some("soon"));
        let ids: Vec<_> = engine.upcoming().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["soon", "late"]);
    }

    #[test]
    fn poll_drops_active_task_missing_from_backend() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("gone", t0(), 10)));
        assert!(engine.reconcile_upcoming(Vec::new()));
        assert!(engine.active_task().is_none());
    }

    #[test]
    fn reset_forgets_in_memory_state() {
        let clock = clock();
        let bus = EventBus::new();
        let mut engine = engine_for("u1", &clock, &stores(), &bus, &FakeGateway::new());
        engine.set_active_task(Some(task("t1", t0(), 10)));
        engine.reset();
        assert!(engine.active_task().is_none());
        assert!(engine.phase().is_none());
        assert_eq!(engine.progress(), 0.0);
    }
}
