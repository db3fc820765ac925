//! Domain records exchanged with the backend: tasks, breaks and mood
//! check-ins, plus the validated inputs used to create them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Prefix of ids minted on the client before the server confirms a task.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Allowed range for mood and stress values.
pub const MOOD_RANGE: (i64, i64) = (1, 5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Work,
    Break,
}

/// Where a task sits relative to the clock. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Scheduled,
    InProgress,
    Finished,
}

/// A scheduled unit of work or break.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pomodoro_enabled: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Phase of this task at `now`.
    pub fn phase_at(&self, now: DateTime<Utc>) -> TaskPhase {
        if now < self.start {
            TaskPhase::Scheduled
        } else if now < self.end {
            TaskPhase::InProgress
        } else {
            TaskPhase::Finished
        }
    }

    /// Expired tasks must never be tracked or restored.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }

    /// Progress percentage in [0, 100] at `now`.
    pub fn progress_at(&self, now: DateTime<Utc>) -> f64 {
        if now < self.start {
            return 0.0;
        }
        if now >= self.end {
            return 100.0;
        }
        let total = (self.end - self.start).num_milliseconds();
        if total <= 0 {
            return 100.0;
        }
        let elapsed = (now - self.start).num_milliseconds();
        (elapsed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Creation timestamp used to arbitrate between conflicting sources.
    /// Falls back to the start instant for records that lack one.
    pub fn created_or_start(&self) -> DateTime<Utc> {
        self.created_at.unwrap_or(self.start)
    }

    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Body of `POST /tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub kind: TaskKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub pomodoro_enabled: bool,
}

impl NewTask {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.end < self.start {
            return Err(ValidationError::InvalidTimeRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Optimistic local copy carrying a temporary id.
    pub fn to_temporary(&self, now: DateTime<Utc>) -> Task {
        Task {
            id: format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()),
            kind: self.kind,
            start: self.start,
            end: self.end,
            completed: false,
            completed_at: None,
            pomodoro_enabled: self.pomodoro_enabled,
            created_at: Some(now),
        }
    }
}

/// Body of `PATCH /tasks/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletion {
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Break {
    pub id: String,
    pub kind: String,
    pub instant: DateTime<Utc>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Body of `POST /break`. Also carried by optimistic break updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBreak {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instant: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl NewBreak {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kind.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "kind".into(),
                message: "break kind must not be empty".into(),
            });
        }
        if let Some(minutes) = self.duration_minutes {
            if minutes == 0 || minutes > 24 * 60 {
                return Err(ValidationError::OutOfRange {
                    field: "duration_minutes".into(),
                    min: 1,
                    max: 24 * 60,
                    value: i64::from(minutes),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mood {
    pub id: String,
    pub mood_value: i64,
    #[serde(default)]
    pub stress_value: Option<i64>,
    pub instant: DateTime<Utc>,
}

/// Body of `POST /mood` and `PUT /mood/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMood {
    pub mood_value: i64,
    pub stress_value: i64,
    pub instant: DateTime<Utc>,
}

impl NewMood {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("mood_value", self.mood_value)?;
        check_range("stress_value", self.stress_value)
    }
}

fn check_range(field: &str, value: i64) -> Result<(), ValidationError> {
    let (min, max) = MOOD_RANGE;
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min,
            max,
            value,
        });
    }
    Ok(())
}
