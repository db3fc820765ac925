//! Process-wide domain events and the bus that delivers them.
//!
//! Delivery is synchronous and FIFO: every listener sees event N before any
//! listener sees event N+1. Publishing from inside a listener enqueues the new
//! event behind the one being dispatched instead of recursing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{Break, Mood, Task};

/// Which counter a weekly update touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Counter {
    Task,
    Break,
    Mood,
}

/// Origin of a weekly aggregate change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    Optimistic,
    Server,
    Storage,
}

/// Every cross-component notification in the application. The set is
/// closed; payloads carry exactly what subscribers consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    TaskCreated { task: Task },
    #[serde(rename_all = "camelCase")]
    TaskDeleted { task_id: String },
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        task_id: String,
        task: Task,
        completion_date: DateTime<Utc>,
    },
    /// Emitted once locally (`confirmed: false`) and again after the server
    /// acknowledges the completion (`confirmed: true`).
    #[serde(rename_all = "camelCase")]
    TaskMarkedCompleted {
        task_id: String,
        task: Task,
        completed_at: DateTime<Utc>,
        #[serde(default)]
        confirmed: bool,
    },
    #[serde(rename_all = "camelCase")]
    MoodAdded { mood: Mood, timestamp: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    BreakAdded {
        #[serde(rename = "break")]
        break_record: Break,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    WeeklyDataUpdated {
        #[serde(rename = "type")]
        counter: Counter,
        date: NaiveDate,
        source: UpdateSource,
    },
    #[serde(rename_all = "camelCase")]
    UserLoggedIn { user_id: String },
    #[serde(rename_all = "camelCase")]
    UserStatsUpdated {
        #[serde(default)]
        current_task_in_progress: Option<Task>,
    },
    #[serde(rename_all = "camelCase")]
    RouteChanged { path: String },
}

impl Event {
    /// Wire name of the event, as used by presentation code.
    pub fn name(&self) -> &'static str {
        match self {
            Event::TaskCreated { .. } => "taskCreated",
            Event::TaskDeleted { .. } => "taskDeleted",
            Event::TaskCompleted { .. } => "taskCompleted",
            Event::TaskMarkedCompleted { .. } => "taskMarkedCompleted",
            Event::MoodAdded { .. } => "moodAdded",
            Event::BreakAdded { .. } => "breakAdded",
            Event::WeeklyDataUpdated { .. } => "weeklyDataUpdated",
            Event::UserLoggedIn { .. } => "userLoggedIn",
            Event::UserStatsUpdated { .. } => "userStatsUpdated",
            Event::RouteChanged { .. } => "routeChanged",
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]; pass it to
/// [`EventBus::unsubscribe`] to stop delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BusState {
    listeners: Vec<(SubscriptionId, Listener)>,
    queue: VecDeque<Event>,
    dispatching: bool,
    next_id: u64,
}

/// Synchronous publish/subscribe channel for one application instance.
#[derive(Default, Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.state.lock().map(|s| s.listeners.len()).unwrap_or(0);
        f.debug_struct("EventBus")
            .field("listeners", &listeners)
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked for every subsequent event.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.lock().listeners.push((id, Arc::new(listener)));
        id
    }

    /// Forward every subsequent event into an unbounded channel, preserving
    /// publish order. The subscription ends when the receiver is dropped.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        let state = Arc::downgrade(&self.state);
        let forward = move |event: &Event| {
            if tx.send(event.clone()).is_err() {
                if let Some(state) = state.upgrade() {
                    lock_state(&state).listeners.retain(|(sid, _)| *sid != id);
                }
            }
        };
        self.lock().listeners.push((id, Arc::new(forward)));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().listeners.retain(|(sid, _)| *sid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Deliver `event` to all listeners. If a dispatch is already running
    /// (a listener publishing), the event is queued and delivered after the
    /// current one completes.
    pub fn publish(&self, event: Event) {
        {
            let mut state = self.lock();
            state.queue.push_back(event);
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        loop {
            let (next, listeners) = {
                let mut state = self.lock();
                match state.queue.pop_front() {
                    Some(event) => {
                        let listeners: Vec<Listener> =
                            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
                        (event, listeners)
                    }
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };
            tracing::trace!(event = next.name(), listeners = listeners.len(), "dispatch");
            for listener in listeners {
                listener(&next);
            }
        }
    }

    fn next_id(&self) -> SubscriptionId {
        let mut state = self.lock();
        state.next_id += 1;
        SubscriptionId(state.next_id)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}
