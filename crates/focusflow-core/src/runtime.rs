//! Cooperative driver for both engines.
//!
//! A single task owns the timer engine and the weekly reconciler and
//! interleaves the progress tick, the periodic polls, bus events, storage
//! changes and gateway results. Gateway calls run as spawned tasks with a
//! timeout; their results come back tagged with the session epoch and are
//! dropped when the session changed while they were in flight.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, GatewayError, ValidationError};
use crate::events::{Event, EventBus, SubscriptionId};
use crate::gateway::{Gateway, HttpGateway, UserStats};
use crate::model::{Break, Mood, NewBreak, NewMood, NewTask, Task, TEMP_ID_PREFIX};
use crate::storage::{
    AuthStore, Config, KvStore, MemoryStore, SnapshotStore, SqliteStore, StorageChange,
};
use crate::timer::{
    CompletionRequest, ReconcileSource, RestoreOutcome, StorageOutcome, TaskTimerEngine,
};
use crate::weekly::{RefreshPayload, WeeklyReconciler};

/// Result of a spawned gateway call.
enum Outcome {
    Upcoming(Result<Vec<Task>, GatewayError>),
    Stats(Result<UserStats, GatewayError>),
    Completion(CompletionRequest, Result<Task, GatewayError>),
    Refresh(Result<RefreshPayload, GatewayError>),
    Moods(Result<Vec<Mood>, GatewayError>),
    TaskCreated(String, Result<Task, GatewayError>),
    TaskDeleted(String, Result<(), GatewayError>),
    MoodSaved(Result<Mood, GatewayError>),
    MoodDeleted(Result<(), GatewayError>),
    BreakCreated(Result<Break, GatewayError>),
}

struct Tagged {
    epoch: u64,
    outcome: Outcome,
}

pub struct Runtime {
    clock: Arc<dyn Clock>,
    store: SnapshotStore,
    auth: Option<AuthStore>,
    bus: EventBus,
    gateway: Arc<dyn Gateway>,
    config: Config,
    timer: TaskTimerEngine,
    weekly: WeeklyReconciler,
    epoch: u64,
    in_flight: usize,
    lookup_in_flight: bool,
    stats_in_flight: bool,
    refresh_in_flight: bool,
    signed_out: bool,
    results_tx: mpsc::UnboundedSender<Tagged>,
    results_rx: mpsc::UnboundedReceiver<Tagged>,
    bus_subscription: SubscriptionId,
    bus_rx: mpsc::UnboundedReceiver<Event>,
    durable_rx: broadcast::Receiver<StorageChange>,
    ephemeral_rx: broadcast::Receiver<StorageChange>,
    tick: Interval,
    timer_poll: Interval,
    weekly_poll: Interval,
    cancel: CancellationToken,
}

impl Runtime {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        user_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        store: SnapshotStore,
        bus: EventBus,
        gateway: Arc<dyn Gateway>,
        config: Config,
    ) -> Self {
        let user_id = user_id.into();
        let timer = TaskTimerEngine::new(
            user_id.clone(),
            Arc::clone(&clock),
            store.clone(),
            bus.clone(),
            Arc::clone(&gateway),
            config.weekly.warn_interval(),
        );
        let weekly = WeeklyReconciler::new(
            user_id,
            Arc::clone(&clock),
            store.clone(),
            bus.clone(),
            Arc::clone(&gateway),
            &config.weekly,
        );
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (bus_subscription, bus_rx) = bus.subscribe_channel();
        let (durable_rx, ephemeral_rx) = store.changes();

        let mut tick = tokio::time::interval(config.timer.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut timer_poll = tokio::time::interval(config.timer.poll_interval());
        timer_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut weekly_poll = tokio::time::interval(config.weekly.poll_interval());
        weekly_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            clock,
            store,
            auth: None,
            bus,
            gateway,
            config,
            timer,
            weekly,
            epoch: 0,
            in_flight: 0,
            lookup_in_flight: false,
            stats_in_flight: false,
            refresh_in_flight: false,
            signed_out: false,
            results_tx,
            results_rx,
            bus_subscription,
            bus_rx,
            durable_rx,
            ephemeral_rx,
            tick,
            timer_poll,
            weekly_poll,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire up the production stack: SQLite durable store, in-memory
    /// ephemeral store, HTTP gateway with the saved session token.
    ///
    /// # Errors
    /// Fails when no session is saved or the store cannot be opened.
    pub fn open(config: Config) -> Result<Self, CoreError> {
        let durable: Arc<dyn KvStore> = Arc::new(SqliteStore::open()?);
        let auth = AuthStore::new(Arc::clone(&durable));
        let session = auth.session()?.ok_or(CoreError::NotLoggedIn)?;
        let gateway = Arc::new(HttpGateway::new(&config.api, session.token)?);
        let clock = Arc::new(SystemClock::with_offset_minutes(config.utc_offset_minutes));
        let store = SnapshotStore::new(durable, Arc::new(MemoryStore::new()));
        Ok(Self::new(session.user_id, clock, store, EventBus::new(), gateway, config).with_auth(auth))
    }

    /// Session store to clear on authentication failure.
    pub fn with_auth(mut self, auth: AuthStore) -> Self {
        self.auth = Some(auth);
        self
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn user_id(&self) -> &str {
        self.timer.user_id()
    }

    pub fn timer(&self) -> &TaskTimerEngine {
        &self.timer
    }

    pub fn weekly(&self) -> &WeeklyReconciler {
        &self.weekly
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn signed_out(&self) -> bool {
        self.signed_out
    }

    /// Requests issued in the current session that have not reported back.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Cancelling the token stops [`Runtime::run`] at its next await.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ── Loop ─────────────────────────────────────────────────────────

    /// Restore persisted state and issue the first lookup and refresh.
    pub fn start(&mut self) {
        if self.timer.restore() == RestoreOutcome::NeedsLookup {
            debug!(user_id = %self.user_id(), "no usable active-task snapshot");
        }
        self.weekly.restore();
        self.start_lookup();
        self.start_stats();
        self.start_refresh();
        self.timer_poll.reset();
        self.weekly_poll.reset();
    }

    /// Run until cancelled or signed out.
    pub async fn run(&mut self) {
        self.start();
        while self.step().await {}
        info!(user_id = %self.user_id(), "runtime stopped");
    }

    /// Wait for one source to fire and handle it. Returns false once the
    /// runtime has been cancelled.
    pub async fn step(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            Some(tagged) = self.results_rx.recv() => self.on_result(tagged),
            Some(event) = self.bus_rx.recv() => self.on_event(event),
            change = self.durable_rx.recv() => self.on_storage_recv(change),
            change = self.ephemeral_rx.recv() => self.on_storage_recv(change),
            _ = self.tick.tick() => self.on_tick(),
            _ = self.timer_poll.tick() => {
                self.start_lookup();
                self.start_stats();
            }
            _ = self.weekly_poll.tick() => self.start_refresh(),
        }
        !self.cancel.is_cancelled()
    }

    /// Handle queued events and wait for every in-flight request of the
    /// current session. Used by one-shot callers that do not run the loop.
    pub async fn settle(&mut self) {
        loop {
            self.drain_local();
            self.on_tick();
            self.drain_local();
            if self.in_flight == 0 {
                break;
            }
            match self.results_rx.recv().await {
                Some(tagged) => self.on_result(tagged),
                None => break,
            }
        }
    }

    // ── User actions ─────────────────────────────────────────────────

    /// Validate and create a task. The returned copy carries a temporary
    /// id until the backend confirms it.
    ///
    /// # Errors
    /// Rejects inverted time ranges before any state changes.
    pub fn create_task(&mut self, input: NewTask) -> Result<Task, ValidationError> {
        input.validate()?;
        let temp = input.to_temporary(self.clock.now());
        let temp_id = temp.id.clone();
        self.bus.publish(Event::TaskCreated { task: temp.clone() });
        let gateway = Arc::clone(&self.gateway);
        self.spawn(
            async move { gateway.create_task(&input).await },
            move |result| Outcome::TaskCreated(temp_id, result),
        );
        Ok(temp)
    }

    pub fn delete_task(&mut self, task_id: &str) {
        let id = task_id.to_string();
        let request_id = id.clone();
        let gateway = Arc::clone(&self.gateway);
        self.spawn(
            async move { gateway.delete_task(&request_id).await },
            move |result| Outcome::TaskDeleted(id, result),
        );
    }

    /// Complete a task before its end instant.
    pub fn complete_task(&mut self, task_id: &str) -> bool {
        match self.timer.request_completion(task_id) {
            Some(request) => {
                self.spawn_completion(request);
                true
            }
            None => false,
        }
    }

    /// # Errors
    /// Rejects out-of-range mood or stress values.
    pub fn add_mood(&mut self, input: NewMood) -> Result<Mood, ValidationError> {
        input.validate()?;
        let mood = Mood {
            id: format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()),
            mood_value: input.mood_value,
            stress_value: Some(input.stress_value),
            instant: input.instant,
        };
        self.bus.publish(Event::MoodAdded {
            mood: mood.clone(),
            timestamp: self.clock.now(),
        });
        let gateway = Arc::clone(&self.gateway);
        self.spawn(
            async move { gateway.create_mood(&input).await },
            Outcome::MoodSaved,
        );
        Ok(mood)
    }

    /// # Errors
    /// Rejects out-of-range mood or stress values.
    pub fn update_mood(&mut self, mood_id: &str, input: NewMood) -> Result<(), ValidationError> {
        input.validate()?;
        let id = mood_id.to_string();
        let gateway = Arc::clone(&self.gateway);
        self.spawn(
            async move { gateway.update_mood(&id, &input).await },
            Outcome::MoodSaved,
        );
        Ok(())
    }

    pub fn delete_mood(&mut self, mood_id: &str) {
        if let Some(instant) = self.weekly.mood_instant(mood_id) {
            self.weekly.optimistic_remove_mood(instant);
        }
        let id = mood_id.to_string();
        let gateway = Arc::clone(&self.gateway);
        self.spawn(
            async move { gateway.delete_mood(&id).await },
            Outcome::MoodDeleted,
        );
    }

    /// # Errors
    /// Rejects empty kinds and out-of-range durations.
    pub fn add_break(&mut self, input: NewBreak) -> Result<Break, ValidationError> {
        input.validate()?;
        let record = Break {
            id: format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()),
            kind: input.kind.clone(),
            instant: input.instant.unwrap_or_else(|| self.clock.now()),
            duration_minutes: input.duration_minutes,
            feedback: input.feedback.clone(),
        };
        self.bus.publish(Event::BreakAdded {
            break_record: record.clone(),
            timestamp: self.clock.now(),
        });
        let gateway = Arc::clone(&self.gateway);
        self.spawn(
            async move { gateway.create_break(&input).await },
            Outcome::BreakCreated,
        );
        Ok(record)
    }

    /// Re-read snapshots, as on window refocus.
    pub fn refocus(&mut self) {
        if self.timer.restore() == RestoreOutcome::NeedsLookup {
            self.start_lookup();
        }
    }

    /// Explicit sign-out: drop every per-user cache and stop.
    pub fn logout(&mut self) {
        info!(user_id = %self.user_id(), "signing out");
        self.teardown();
    }

    pub fn start_lookup(&mut self) {
        if self.lookup_in_flight || self.signed_out {
            return;
        }
        self.lookup_in_flight = true;
        let gateway = Arc::clone(&self.gateway);
        self.spawn(
            async move { gateway.upcoming_tasks().await },
            Outcome::Upcoming,
        );
    }

    /// Fetch dashboard stats; a task reported in progress is offered to
    /// the timer through a `UserStatsUpdated` event.
    pub fn start_stats(&mut self) {
        if self.stats_in_flight || self.signed_out {
            return;
        }
        self.stats_in_flight = true;
        let gateway = Arc::clone(&self.gateway);
        self.spawn(async move { gateway.user_stats().await }, Outcome::Stats);
    }

    pub fn start_refresh(&mut self) {
        if self.refresh_in_flight || self.signed_out {
            return;
        }
        self.refresh_in_flight = true;
        let gateway = Arc::clone(&self.gateway);
        self.spawn(
            async move { RefreshPayload::fetch(gateway.as_ref()).await },
            Outcome::Refresh,
        );
    }

    // ── Handlers ─────────────────────────────────────────────────────

    fn on_tick(&mut self) {
        if let Some(request) = self.timer.tick() {
            self.spawn_completion(request);
            self.start_lookup();
        }
        self.flush_completions();
        if self.weekly.take_due_refresh() {
            self.start_refresh();
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::TaskCreated { task } => {
                self.timer.reconcile(Some(task.clone()), ReconcileSource::Event);
                self.flush_completions();
                self.weekly.optimistic_add_task(task.start);
            }
            Event::TaskDeleted { task_id } => {
                if self.timer.on_task_deleted(&task_id) {
                    self.start_lookup();
                }
            }
            Event::TaskCompleted { task_id, .. } => {
                if self.timer.on_task_completed_elsewhere(&task_id) {
                    self.start_lookup();
                }
            }
            Event::MoodAdded { mood, .. } => {
                self.weekly.optimistic_add_mood(mood.mood_value, mood.instant);
            }
            Event::BreakAdded { break_record, .. } => {
                self.weekly.optimistic_add_break(&break_record);
            }
            Event::UserStatsUpdated {
                current_task_in_progress,
            } => {
                self.timer.reconcile(
                    current_task_in_progress,
                    ReconcileSource::Event,
                );
                self.flush_completions();
            }
            Event::UserLoggedIn { user_id } => {
                if user_id != self.user_id() {
                    self.switch_user(&user_id);
                }
            }
            Event::RouteChanged { path } => {
                debug!(%path, "route changed");
                self.refocus();
            }
            Event::TaskMarkedCompleted { .. } | Event::WeeklyDataUpdated { .. } => {}
        }
    }

    fn on_storage_recv(&mut self, change: Result<StorageChange, broadcast::error::RecvError>) {
        match change {
            Ok(change) => self.on_storage_change(&change),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "storage feed lagged, re-reading snapshots");
                self.refocus();
                self.weekly.restore();
            }
            Err(broadcast::error::RecvError::Closed) => {}
        }
    }

    fn on_storage_change(&mut self, change: &StorageChange) {
        if AuthStore::is_session_key(&change.key) && change.value.is_none() {
            if !self.signed_out {
                info!(user_id = %self.user_id(), "session ended elsewhere");
                self.teardown();
            }
            return;
        }
        if self.timer.on_storage_change(change) == StorageOutcome::NeedsLookup {
            self.start_lookup();
        }
        self.weekly.on_storage_change(change);
    }

    fn on_result(&mut self, tagged: Tagged) {
        if tagged.epoch != self.epoch {
            debug!(epoch = tagged.epoch, current = self.epoch, "dropping result from previous session");
            return;
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        match tagged.outcome {
            Outcome::Upcoming(result) => {
                self.lookup_in_flight = false;
                match result {
                    Ok(tasks) => {
                        self.timer.note_lookup_success();
                        self.timer.reconcile_upcoming(tasks);
                        self.flush_completions();
                    }
                    Err(e) if e.is_auth_failure() => self.sign_out(&e),
                    Err(e) => self.timer.note_lookup_failure(&e),
                }
            }
            Outcome::Stats(result) => {
                self.stats_in_flight = false;
                match result {
                    Ok(stats) => self.bus.publish(Event::UserStatsUpdated {
                        current_task_in_progress: stats.current_task_in_progress,
                    }),
                    Err(e) if e.is_auth_failure() => self.sign_out(&e),
                    Err(e) => self.timer.note_lookup_failure(&e),
                }
            }
            Outcome::Completion(request, result) => {
                if let Err(e) = self.timer.apply_completion_result(&request, result) {
                    self.sign_out(&e);
                }
            }
            Outcome::Refresh(result) => {
                self.refresh_in_flight = false;
                match result {
                    Ok(payload) => self.weekly.apply_refresh(payload),
                    Err(e) if e.is_auth_failure() => self.sign_out(&e),
                    Err(e) => self.weekly.note_refresh_failure(&e),
                }
            }
            Outcome::Moods(result) => match result {
                Ok(moods) => self.weekly.apply_mood_list(moods),
                Err(e) if e.is_auth_failure() => self.sign_out(&e),
                Err(e) => self.weekly.note_refresh_failure(&e),
            },
            Outcome::TaskCreated(temp_id, result) => match result {
                Ok(task) => {
                    info!(temp_id = %temp_id, task_id = %task.id, "task created");
                    self.timer.confirm_task_id(&temp_id, task);
                }
                Err(e) if e.is_auth_failure() => self.sign_out(&e),
                Err(e) => {
                    warn!(temp_id = %temp_id, error = %e, "task creation failed, dropping local copy");
                    if self.timer.on_task_deleted(&temp_id) {
                        self.start_lookup();
                    }
                }
            },
            Outcome::TaskDeleted(task_id, result) => match result {
                Ok(()) => {
                    self.bus.publish(Event::TaskDeleted { task_id });
                    self.start_refresh();
                }
                Err(e) if e.is_auth_failure() => self.sign_out(&e),
                Err(e) => warn!(task_id = %task_id, error = %e, "task deletion failed"),
            },
            Outcome::MoodSaved(result) => match result {
                Ok(mood) => {
                    debug!(mood_id = %mood.id, "mood saved");
                    self.sync_moods();
                }
                Err(e) if e.is_auth_failure() => self.sign_out(&e),
                Err(e) => {
                    warn!(error = %e, "mood not saved");
                    self.sync_moods();
                }
            },
            Outcome::MoodDeleted(result) => match result {
                Ok(()) => self.sync_moods(),
                Err(e) if e.is_auth_failure() => self.sign_out(&e),
                Err(e) => {
                    warn!(error = %e, "mood deletion failed");
                    self.sync_moods();
                }
            },
            Outcome::BreakCreated(result) => match result {
                Ok(record) => debug!(break_id = %record.id, "break saved"),
                Err(e) if e.is_auth_failure() => self.sign_out(&e),
                Err(e) => warn!(error = %e, "break not saved"),
            },
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn drain_local(&mut self) {
        while let Ok(event) = self.bus_rx.try_recv() {
            self.on_event(event);
        }
        loop {
            match self.durable_rx.try_recv() {
                Ok(change) => self.on_storage_change(&change),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.on_storage_recv(Err(broadcast::error::RecvError::Lagged(missed)));
                }
                Err(_) => break,
            }
        }
        loop {
            match self.ephemeral_rx.try_recv() {
                Ok(change) => self.on_storage_change(&change),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.on_storage_recv(Err(broadcast::error::RecvError::Lagged(missed)));
                }
                Err(_) => break,
            }
        }
    }

    fn sync_moods(&mut self) {
        let gateway = Arc::clone(&self.gateway);
        self.spawn(async move { gateway.list_moods().await }, Outcome::Moods);
    }

    fn spawn_completion(&mut self, request: CompletionRequest) {
        let gateway = Arc::clone(&self.gateway);
        let body = request.body();
        let task_id = request.task.id.clone();
        self.spawn(
            async move { gateway.complete_task(&task_id, &body).await },
            move |result| Outcome::Completion(request, result),
        );
    }

    fn flush_completions(&mut self) {
        for request in self.timer.drain_completions() {
            self.spawn_completion(request);
        }
    }

    fn spawn<T, F, M>(&mut self, request: F, wrap: M)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, GatewayError>> + Send + 'static,
        M: FnOnce(Result<T, GatewayError>) -> Outcome + Send + 'static,
    {
        let epoch = self.epoch;
        let limit = self.config.api.timeout();
        let tx = self.results_tx.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, request).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    timeout_secs: limit.as_secs(),
                }),
            };
            let _ = tx.send(Tagged {
                epoch,
                outcome: wrap(result),
            });
        });
    }

    fn sign_out(&mut self, error: &GatewayError) {
        warn!(user_id = %self.user_id(), error = %error, "authentication rejected, signing out");
        self.teardown();
    }

    fn teardown(&mut self) {
        let user_id = self.user_id().to_string();
        if let Err(e) = self.store.clear_user(&user_id) {
            warn!(user_id = %user_id, error = %e, "failed to clear cached state");
        }
        if let Some(auth) = &self.auth {
            if let Err(e) = auth.clear() {
                warn!(error = %e, "failed to clear saved session");
            }
        }
        self.timer.reset();
        self.weekly.reset();
        self.next_epoch();
        self.signed_out = true;
        self.cancel.cancel();
    }

    fn switch_user(&mut self, user_id: &str) {
        info!(from = %self.user_id(), to = %user_id, "switching user");
        self.next_epoch();
        self.timer = TaskTimerEngine::new(
            user_id,
            Arc::clone(&self.clock),
            self.store.clone(),
            self.bus.clone(),
            Arc::clone(&self.gateway),
            self.config.weekly.warn_interval(),
        );
        self.weekly = WeeklyReconciler::new(
            user_id,
            Arc::clone(&self.clock),
            self.store.clone(),
            self.bus.clone(),
            Arc::clone(&self.gateway),
            &self.config.weekly,
        );
        self.signed_out = false;
        self.start();
    }

    fn next_epoch(&mut self) {
        self.epoch += 1;
        self.in_flight = 0;
        self.lookup_in_flight = false;
        self.stats_in_flight = false;
        self.refresh_in_flight = false;
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.bus.unsubscribe(self.bus_subscription);
    }
}
