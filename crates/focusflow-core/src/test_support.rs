//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::clock::ManualClock;
use crate::error::GatewayError;
use crate::events::{Event, EventBus};
use crate::gateway::{Gateway, UserStats, WeeklyData};
use crate::model::{Break, Mood, NewBreak, NewMood, NewTask, Task, TaskCompletion, TaskKind};
use crate::storage::{MemoryStore, SnapshotStore};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap()
}

pub fn task(id: &str, start: DateTime<Utc>, minutes: i64) -> Task {
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

pub fn stores() -> SnapshotStore {
    SnapshotStore::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
}

/// Records every published event.
pub fn recorder(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    seen
}

/// Scriptable in-memory backend.
#[derive(Default)]
pub struct FakeGateway {
    pub upcoming: Mutex<Vec<Task>>,
    pub tasks: Mutex<Vec<Task>>,
    pub breaks: Mutex<Vec<Break>>,
    pub moods: Mutex<Vec<Mood>>,
    pub weekly: Mutex<WeeklyData>,
    pub fail_with: Mutex<Option<fn() -> GatewayError>>,
    pub completed: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, f: Option<fn() -> GatewayError>) {
        *self.fail_with.lock().unwrap() = f;
    }

    fn check(&self) -> Result<(), GatewayError> {
        match *self.fail_with.lock().unwrap() {
            Some(f) => Err(f()),
            None => Ok(()),
        }
    }
}

pub fn network_down() -> GatewayError {
    GatewayError::Network("connection refused".into())
}

pub fn unauthorized() -> GatewayError {
    GatewayError::Unauthorized { status: 401 }
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn list_tasks(&self) -> Result<Vec<Task>, GatewayError> {
        self.check()?;
        Ok(self.tasks.lock().unwrap().clone())
    }

    async fn upcoming_tasks(&self) -> Result<Vec<Task>, GatewayError> {
        self.check()?;
        Ok(self.upcoming.lock().unwrap().clone())
    }

    async fn create_task(&self, input: &NewTask) -> Result<Task, GatewayError> {
        self.check()?;
        let mut tasks = self.tasks.lock().unwrap();
        let task = Task {
            id: format!("srv-{}", tasks.len() + 1),
            kind: input.kind,
            start: input.start,
            end: input.end,
            completed: false,
            completed_at: None,
            pomodoro_enabled: input.pomodoro_enabled,
            created_at: Some(input.start),
        };
        tasks.push(task.clone());
        Ok(task)
    }

    async fn complete_task(
        &self,
        task_id: &str,
        completion: &TaskCompletion,
    ) -> Result<Task, GatewayError> {
        self.check()?;
        self.completed.lock().unwrap().push(task_id.to_string());
        let mut record = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .chain(self.upcoming.lock().unwrap().iter())
            .find(|t| t.id == task_id)
            .cloned()
            .unwrap_or_else(|| task(task_id, t0(), 1));
        record.completed = completion.completed;
        record.completed_at = completion.completed_at;
        Ok(record)
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), GatewayError> {
        self.check()?;
        self.tasks.lock().unwrap().retain(|t| t.id != task_id);
        self.upcoming.lock().unwrap().retain(|t| t.id != task_id);
        Ok(())
    }

    async fn list_breaks(&self) -> Result<Vec<Break>, GatewayError> {
        self.check()?;
        Ok(self.breaks.lock().unwrap().clone())
    }

    async fn create_break(&self, input: &NewBreak) -> Result<Break, GatewayError> {
        self.check()?;
        let mut breaks = self.breaks.lock().unwrap();
        let record = Break {
            id: format!("brk-{}", breaks.len() + 1),
            kind: input.kind.clone(),
            instant: input.instant.unwrap_or_else(t0),
            duration_minutes: input.duration_minutes,
            feedback: input.feedback.clone(),
        };
        breaks.push(record.clone());
        Ok(record)
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
        mood.stress_value = Some(input.stress_value);
        mood.instant = input.instant;
        Ok(mood.clone())
    }

    async fn delete_mood(&self, mood_id: &str) -> Result<(), GatewayError> {
        self.check()?;
        self.moods.lock().unwrap().retain(|m| m.id != mood_id);
        Ok(())
    }

    async fn weekly_data(&self) -> Result<WeeklyData, GatewayError> {
        self.check()?;
        Ok(self.weekly.lock().unwrap().clone())
    }

    async fn user_stats(&self) -> Result<UserStats, GatewayError> {
        self.check()?;
        Ok(UserStats::default())
    }
}
