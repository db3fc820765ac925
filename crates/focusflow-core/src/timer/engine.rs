//! Active-task timer engine.
//!
//! Tracks the single task that is in progress or next up for the logged-in
//! user. Progress and phase are pure functions of the clock and the task's
//! start/end instants; the engine has no internal thread. The caller invokes
//! `tick()` at least every 250 ms while a task is tracked, and feeds every
//! "there may be a different task now" signal (poll, bus event, storage
//! change, restore) through one reconciliation path.
//!
//! ## Phases
//!
//! ```text
//! Scheduled -> InProgress -> Finished
//! ```
//!
//! Phases never move backwards. Entering `Finished` fires the completion
//! side effects at most once per task id, even across restarts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::snapshot::ActiveTaskSnapshot;
use crate::clock::{Clock, MonotonicGuard};
use crate::error::GatewayError;
use crate::events::{Event, EventBus};
use crate::gateway::Gateway;
use crate::model::{Task, TaskCompletion, TaskPhase};
use crate::storage::{keys, SnapshotSource, SnapshotStore, StorageChange};
use crate::throttle::LogThrottle;

/// Which signal asked for a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSource {
    /// Earliest upcoming task reported by the backend.
    Poll,
    /// In-process bus notification (task created, stats update).
    Event,
    /// Snapshot written by another instance sharing the store.
    Storage,
    /// Snapshot read on startup or refocus.
    Restore,
}

/// Completion that still has to be confirmed against the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub task: Task,
    pub completed_at: DateTime<Utc>,
}

impl CompletionRequest {
    pub fn body(&self) -> TaskCompletion {
        TaskCompletion {
            completed: true,
            completed_at: Some(self.completed_at),
        }
    }
}

/// Result of reading persisted snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored(SnapshotSource),
    /// Nothing usable in storage; ask the backend.
    NeedsLookup,
}

/// What the caller should do after a storage change was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOutcome {
    Ignored,
    Adopted,
    /// Another instance cleared this user's snapshot; re-check the backend.
    NeedsLookup,
}

pub struct TaskTimerEngine {
    user_id: String,
    instance_id: String,
    clock: Arc<dyn Clock>,
    store: SnapshotStore,
    bus: EventBus,
    gateway: Arc<dyn Gateway>,
    active: Option<Task>,
    phase: Option<TaskPhase>,
    progress: f64,
    monotonic: MonotonicGuard,
    last_completed_id: Option<String>,
    last_persisted_pct: Option<u8>,
    upcoming: Vec<Task>,
    pending_completions: Vec<CompletionRequest>,
    throttle: LogThrottle,
}

impl TaskTimerEngine {
    pub fn new(
        user_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        store: SnapshotStore,
        bus: EventBus,
        gateway: Arc<dyn Gateway>,
        warn_interval: chrono::Duration,
    ) -> Self {
        let user_id = user_id.into();
        let last_completed_id = store.completion_guard(&user_id);
        Self {
            user_id,
            instance_id: uuid::Uuid::new_v4().to_string(),
            clock,
            store,
            bus,
            gateway,
            active: None,
            phase: None,
            progress: 0.0,
            monotonic: MonotonicGuard::default(),
            last_completed_id,
            last_persisted_pct: None,
            upcoming: Vec::new(),
            pending_completions: Vec::new(),
            throttle: LogThrottle::new(warn_interval),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn active_task(&self) -> Option<&Task> {
        self.active.as_ref()
    }

    pub fn phase(&self) -> Option<TaskPhase> {
        self.phase
    }

    /// Progress of the active task in [0, 100] as of the last tick.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn is_running(&self) -> bool {
        self.phase == Some(TaskPhase::InProgress)
    }

    pub fn scheduled_for_future(&self) -> bool {
        self.phase == Some(TaskPhase::Scheduled)
    }

    /// Unexpired upcoming tasks from the last lookup, earliest first.
    pub fn upcoming(&self) -> &[Task] {
        &self.upcoming
    }

    pub fn gateway(&self) -> Arc<dyn Gateway> {
        Arc::clone(&self.gateway)
    }

    pub fn snapshot(&self) -> Option<ActiveTaskSnapshot> {
        let task = self.active.as_ref()?;
        Some(ActiveTaskSnapshot {
            task: task.clone(),
            captured_at: self.clock.now(),
            user_id: self.user_id.clone(),
            running: self.is_running(),
            progress: self.progress,
            scheduled_for_future: self.scheduled_for_future(),
            writer: Some(self.instance_id.clone()),
        })
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Replace the tracked task. Progress is recomputed immediately and the
    /// snapshot written (or cleared) in both stores. Expired tasks are
    /// never tracked; passing one clears the engine.
    pub fn set_active_task(&mut self, task: Option<Task>) {
        let now = self.now();
        match task {
            Some(task) if !task.is_expired_at(now) => {
                let same_task = self.active.as_ref().map(|t| t.id == task.id) == Some(true);
                if !same_task {
                    self.phase = None;
                    self.last_persisted_pct = None;
                    debug!(user_id = %self.user_id, task_id = %task.id, "tracking task");
                }
                self.active = Some(task);
                self.recompute(now);
                self.persist(now);
            }
            Some(task) => {
                debug!(task_id = %task.id, "refusing to track expired task");
                self.clear_active();
            }
            None => self.clear_active(),
        }
    }

    /// Recompute progress. Returns a completion request the first time the
    /// active task reaches its end; the local "marked completed" event has
    /// already been published by then.
    pub fn tick(&mut self) -> Option<CompletionRequest> {
        let now = self.now();
        self.active.as_ref()?;
        let before = self.phase;
        self.recompute(now);

        if self.phase == Some(TaskPhase::Finished) {
            let task = self.active.take()?;
            let request = self.begin_completion(&task, now);
            self.clear_active();
            return request;
        }

        let pct = self.progress.floor() as u8;
        if before != self.phase || self.last_persisted_pct != Some(pct) {
            self.persist(now);
        }
        None
    }

    /// Mark `task_id` completed: publish the optimistic event, then persist
    /// completion through the gateway and publish the confirmation.
    /// A network failure leaves the optimistic completion in place.
    ///
    /// # Errors
    /// Only authentication failures are returned; the caller must tear down
    /// the session.
    pub async fn mark_task_completed(&mut self, task_id: &str) -> Result<(), GatewayError> {
        let Some(request) = self.request_completion(task_id) else {
            return Ok(());
        };
        let result = self
            .gateway
            .complete_task(&request.task.id, &request.body())
            .await;
        self.apply_completion_result(&request, result)
    }

    /// Local half of a manual completion: publish the optimistic event and
    /// stop tracking the task. Returns `None` for unknown tasks and for
    /// tasks whose completion already fired.
    pub fn request_completion(&mut self, task_id: &str) -> Option<CompletionRequest> {
        let now = self.now();
        let task = self.find_known(task_id)?;
        let request = self.begin_completion(&task, now)?;
        if self.active.as_ref().map(|t| t.id.as_str()) == Some(task_id) {
            self.clear_active();
        }
        self.upcoming.retain(|t| t.id != task_id);
        Some(request)
    }

    /// Publish the server acknowledgement, or keep the optimistic state on
    /// transient failure.
    ///
    /// # Errors
    /// Returns authentication failures unchanged.
    pub fn apply_completion_result(
        &mut self,
        request: &CompletionRequest,
        result: Result<Task, GatewayError>,
    ) -> Result<(), GatewayError> {
        match result {
            Ok(server_task) => {
                info!(task_id = %server_task.id, "completion confirmed");
                self.throttle.recovered();
                self.bus.publish(Event::TaskMarkedCompleted {
                    task_id: request.task.id.clone(),
                    completed_at: server_task.completed_at.unwrap_or(request.completed_at),
                    task: server_task,
                    confirmed: true,
                });
                Ok(())
            }
            Err(e) if e.is_auth_failure() => Err(e),
            Err(e) => {
                self.warn_throttled("completion not confirmed, keeping local state", &e);
                Ok(())
            }
        }
    }

    /// Ask the backend for upcoming tasks and return the earliest one still
    /// running or ahead. Updates the upcoming list.
    ///
    /// # Errors
    /// Returns the gateway error; callers treat transient failures as
    /// "try again next poll".
    pub async fn find_next_scheduled_task(&mut self) -> Result<Option<Task>, GatewayError> {
        let tasks = self.gateway.upcoming_tasks().await?;
        Ok(self.apply_upcoming(tasks))
    }

    /// Filter and sort a backend task list into the upcoming list.
    pub fn apply_upcoming(&mut self, tasks: Vec<Task>) -> Option<Task> {
        let now = self.now();
        let mut upcoming: Vec<Task> = tasks
            .into_iter()
            .filter(|t| !t.is_expired_at(now) && !t.completed)
            .filter(|t| self.last_completed_id.as_deref() != Some(t.id.as_str()))
            .collect();
        upcoming.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        self.upcoming = upcoming;
        self.upcoming.first().cloned()
    }

    /// Apply a full backend lookup: drop an active task the server no longer
    /// lists, then reconcile against the earliest upcoming task.
    pub fn reconcile_upcoming(&mut self, tasks: Vec<Task>) -> bool {
        let next = self.apply_upcoming(tasks);
        let mut changed = false;
        if let Some(active) = &self.active {
            let listed = self.upcoming.iter().any(|t| t.id == active.id);
            if !listed && !active.is_temporary() {
                debug!(task_id = %active.id, "active task no longer listed by backend");
                self.clear_active();
                changed = true;
            }
        }
        self.reconcile(next, ReconcileSource::Poll) || changed
    }

    /// The single adopt-if-newer rule shared by every trigger. Idempotent:
    /// reconciling the task already tracked is a no-op unless its fields
    /// changed. Returns whether the tracked task changed.
    ///
    /// - expired, completed or already-fired candidates are ignored
    /// - an in-progress task outranks a scheduled one
    /// - for backend lookups, the earlier start wins
    /// - otherwise the most recently created task wins; ties keep the
    ///   current task
    pub fn reconcile(&mut self, candidate: Option<Task>, source: ReconcileSource) -> bool {
        let now = self.now();
        if self
            .active
            .as_ref()
            .is_some_and(|t| t.is_expired_at(now))
        {
            if let Some(request) = self.tick() {
                self.pending_completions.push(request);
            }
        }

        let Some(candidate) = candidate else {
            return false;
        };
        if candidate.is_expired_at(now)
            || candidate.completed
            || self.last_completed_id.as_deref() == Some(candidate.id.as_str())
        {
            return false;
        }

        let adopt = match &self.active {
            None => true,
            Some(current) if current.id == candidate.id => *current != candidate,
            Some(current) => candidate_wins(current, &candidate, source, now),
        };
        if adopt {
            debug!(task_id = %candidate.id, ?source, "adopting task");
            self.set_active_task(Some(candidate));
        }
        adopt
    }

    /// Remove a deleted task from all local state. Returns true when it was
    /// the active task, in which case the caller should look up the next one.
    pub fn on_task_deleted(&mut self, task_id: &str) -> bool {
        self.upcoming.retain(|t| t.id != task_id);
        if self.active.as_ref().map(|t| t.id.as_str()) == Some(task_id) {
            info!(task_id, "active task deleted");
            self.clear_active();
            return true;
        }
        false
    }

    /// A task was completed elsewhere (another surface or instance).
    pub fn on_task_completed_elsewhere(&mut self, task_id: &str) -> bool {
        self.remember_completion(task_id);
        self.on_task_deleted(task_id)
    }

    /// Swap a temporary client id for the server-assigned record.
    pub fn confirm_task_id(&mut self, temp_id: &str, server_task: Task) {
        for task in self.upcoming.iter_mut().filter(|t| t.id == temp_id) {
            *task = server_task.clone();
        }
        if self.active.as_ref().map(|t| t.id.as_str()) == Some(temp_id) {
            let mut confirmed = server_task;
            if confirmed.created_at.is_none() {
                confirmed.created_at = self.active.as_ref().and_then(|t| t.created_at);
            }
            // Same logical task: keep phase and progress continuity.
            self.active = Some(confirmed);
            let now = self.now();
            self.recompute(now);
            self.persist(now);
        }
    }

    /// Read persisted snapshots in priority order and adopt the first one
    /// that is unexpired and owned by this user.
    pub fn restore(&mut self) -> RestoreOutcome {
        let now = self.now();
        for source in SnapshotSource::RESTORE_ORDER {
            let Some(snapshot) = self.store.load_active(source, &self.user_id) else {
                continue;
            };
            if snapshot.user_id != self.user_id {
                debug!(?source, "snapshot belongs to another user, skipping");
                if source != SnapshotSource::LegacyDurable {
                    self.discard(source);
                }
                continue;
            }
            if snapshot.is_expired_at(now)
                || self.last_completed_id.as_deref() == Some(snapshot.task.id.as_str())
            {
                debug!(?source, task_id = %snapshot.task.id, "discarding expired snapshot");
                self.discard(source);
                continue;
            }

            self.reconcile(Some(snapshot.task), ReconcileSource::Restore);
            if source == SnapshotSource::LegacyDurable {
                // Re-home under the per-user key.
                let now = self.now();
                self.persist(now);
                if let Err(e) = self.store.clear_legacy_active() {
                    debug!(error = %e, "failed to clear legacy snapshot");
                }
            }
            return RestoreOutcome::Restored(source);
        }
        RestoreOutcome::NeedsLookup
    }

    /// Restore from storage, falling back to a backend lookup.
    ///
    /// # Errors
    /// Returns the gateway error from the fallback lookup.
    pub async fn restore_or_lookup(&mut self) -> Result<Option<&Task>, GatewayError> {
        if self.restore() == RestoreOutcome::NeedsLookup {
            let tasks = self.gateway.upcoming_tasks().await?;
            self.reconcile_upcoming(tasks);
        }
        Ok(self.active.as_ref())
    }

    /// Apply a write observed on a shared store.
    pub fn on_storage_change(&mut self, change: &StorageChange) -> StorageOutcome {
        if change.key != keys::active_task(&self.user_id) {
            return StorageOutcome::Ignored;
        }
        let Some(raw) = change.value.as_deref() else {
            // Our own clears are followed by a fresh write whenever we still
            // track something, so a missing entry here came from elsewhere.
            let still_missing = self
                .store
                .load_active(SnapshotSource::UserDurable, &self.user_id)
                .is_none();
            return if self.active.is_some() && still_missing {
                StorageOutcome::NeedsLookup
            } else {
                StorageOutcome::Ignored
            };
        };
        let snapshot: ActiveTaskSnapshot = match serde_json::from_str(raw) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "ignoring malformed snapshot change");
                return StorageOutcome::Ignored;
            }
        };
        if snapshot.user_id != self.user_id
            || snapshot.writer.as_deref() == Some(self.instance_id.as_str())
        {
            return StorageOutcome::Ignored;
        }
        if self.reconcile(Some(snapshot.task), ReconcileSource::Storage) {
            StorageOutcome::Adopted
        } else {
            StorageOutcome::Ignored
        }
    }

    /// Forget all in-memory state. Persistent per-user entries are cleared
    /// by the session owner.
    pub fn reset(&mut self) {
        self.active = None;
        self.phase = None;
        self.progress = 0.0;
        self.upcoming.clear();
        self.pending_completions.clear();
        self.last_persisted_pct = None;
        self.monotonic.reset();
    }

    /// Completions fired outside `tick()` (during reconciliation) that still
    /// need backend confirmation.
    pub fn drain_completions(&mut self) -> Vec<CompletionRequest> {
        std::mem::take(&mut self.pending_completions)
    }

    /// Log a failed lookup without flooding during long outages.
    pub fn note_lookup_failure(&mut self, error: &GatewayError) {
        self.warn_throttled("upcoming task lookup failed", error);
    }

    pub fn note_lookup_success(&mut self) {
        self.throttle.recovered();
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn now(&mut self) -> DateTime<Utc> {
        self.monotonic.observe(self.clock.now())
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        let Some(task) = &self.active else {
            self.phase = None;
            self.progress = 0.0;
            return;
        };
        let phase = task.phase_at(now);
        self.phase = Some(match self.phase {
            Some(previous) if previous > phase => previous,
            _ => phase,
        });
        let progress = task.progress_at(now);
        self.progress = if self.phase == Some(TaskPhase::Finished) {
            100.0
        } else {
            progress
        };
    }

    fn begin_completion(&mut self, task: &Task, now: DateTime<Utc>) -> Option<CompletionRequest> {
        if task.completed || self.last_completed_id.as_deref() == Some(task.id.as_str()) {
            return None;
        }
        self.remember_completion(&task.id);

        let mut completed = task.clone();
        completed.completed = true;
        completed.completed_at = Some(now);
        info!(task_id = %task.id, "task finished");
        self.bus.publish(Event::TaskMarkedCompleted {
            task_id: task.id.clone(),
            task: completed.clone(),
            completed_at: now,
            confirmed: false,
        });
        Some(CompletionRequest {
            task: completed,
            completed_at: now,
        })
    }

    fn remember_completion(&mut self, task_id: &str) {
        self.last_completed_id = Some(task_id.to_string());
        if let Err(e) = self.store.set_completion_guard(&self.user_id, task_id) {
            debug!(error = %e, "failed to persist completion guard");
        }
    }

    fn find_known(&self, task_id: &str) -> Option<Task> {
        self.active
            .iter()
            .chain(self.upcoming.iter())
            .find(|t| t.id == task_id)
            .cloned()
    }

    fn clear_active(&mut self) {
        self.active = None;
        self.phase = None;
        self.progress = 0.0;
        self.last_persisted_pct = None;
        if let Err(e) = self.store.clear_active(&self.user_id) {
            debug!(error = %e, "failed to clear active-task snapshot");
        }
    }

    fn persist(&mut self, now: DateTime<Utc>) {
        let Some(task) = &self.active else {
            return;
        };
        let mut snapshot = ActiveTaskSnapshot::capture(task, &self.user_id, now);
        snapshot.progress = self.progress;
        snapshot.running = self.is_running();
        snapshot.scheduled_for_future = self.scheduled_for_future();
        snapshot.writer = Some(self.instance_id.clone());
        match self.store.save_active(&snapshot) {
            Ok(()) => self.last_persisted_pct = Some(self.progress.floor() as u8),
            Err(e) => debug!(error = %e, "failed to persist active-task snapshot"),
        }
    }

    fn discard(&self, source: SnapshotSource) {
        if let Err(e) = self.store.discard_active(source, &self.user_id) {
            debug!(error = %e, "failed to discard snapshot");
        }
    }

    fn warn_throttled(&mut self, message: &str, error: &GatewayError) {
        let now = self.clock.now();
        if let Some(suppressed) = self.throttle.permit(now) {
            warn!(user_id = %self.user_id, error = %error, suppressed, "{message}");
        }
    }
}

fn candidate_wins(
    current: &Task,
    candidate: &Task,
    source: ReconcileSource,
    now: DateTime<Utc>,
) -> bool {
    let current_phase = current.phase_at(now);
    let candidate_phase = candidate.phase_at(now);
    if current_phase != candidate_phase {
        return candidate_phase == TaskPhase::InProgress;
    }
    if source == ReconcileSource::Poll && candidate.start != current.start {
        return candidate.start < current.start;
    }
    candidate.created_or_start() > current.created_or_start()
}
