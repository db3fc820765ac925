use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Task, TaskPhase};

/// Persisted view of the timer engine, keyed by owning user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTaskSnapshot {
    pub task: Task,
    pub captured_at: DateTime<Utc>,
    pub user_id: String,
    pub running: bool,
    pub progress: f64,
    pub scheduled_for_future: bool,
    /// Instance that wrote the snapshot; writers ignore their own changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<String>,
}

impl ActiveTaskSnapshot {
    pub fn capture(task: &Task, user_id: &str, now: DateTime<Utc>) -> Self {
        let phase = task.phase_at(now);
        Self {
            task: task.clone(),
            captured_at: now,
            user_id: user_id.to_string(),
            running: phase == TaskPhase::InProgress,
            progress: task.progress_at(now),
            scheduled_for_future: phase == TaskPhase::Scheduled,
            writer: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.task.is_expired_at(now)
    }
}
