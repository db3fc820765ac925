//! Remote data gateway: the REST contract both engines consume.
//!
//! [`HttpGateway`] talks to the real backend. Tests substitute their own
//! [`Gateway`] implementations.

mod http;

pub use http::HttpGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::model::{Break, Mood, NewBreak, NewMood, NewTask, Task, TaskCompletion};

/// Authoritative weekly snapshot, `GET /api/dashboard/weekly-data`.
/// Arrays are expected to hold seven entries, oldest first, ending today.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyData {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub tasks_per_day: Vec<u32>,
    #[serde(default)]
    pub breaks_per_day: Vec<u32>,
    #[serde(default)]
    pub mood_avg_per_day: Vec<Option<f64>>,
    #[serde(default)]
    pub mood_counts_per_day: Vec<u32>,
    #[serde(default)]
    pub current_streak: u32,
    #[serde(default)]
    pub longest_streak: u32,
    #[serde(default)]
    pub streak_data: Vec<bool>,
}

/// `GET /api/dashboard/user-stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub mood_score: Option<f64>,
    #[serde(default)]
    pub longest_streak: u32,
    #[serde(default)]
    pub weekly_goal: u32,
    #[serde(default)]
    pub hours_worked: f64,
    #[serde(default)]
    pub current_task_in_progress: Option<Task>,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub total_tasks: u32,
}

/// Backend operations. Every call carries the session's bearer token;
/// 401/403 surface as [`GatewayError::Unauthorized`].
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<Task>, GatewayError>;
    async fn upcoming_tasks(&self) -> Result<Vec<Task>, GatewayError>;
    async fn create_task(&self, input: &NewTask) -> Result<Task, GatewayError>;
    async fn complete_task(
        &self,
        task_id: &str,
        completion: &TaskCompletion,
    ) -> Result<Task, GatewayError>;
    async fn delete_task(&self, task_id: &str) -> Result<(), GatewayError>;

    async fn list_breaks(&self) -> Result<Vec<Break>, GatewayError>;
    async fn create_break(&self, input: &NewBreak) -> Result<Break, GatewayError>;

    async fn list_moods(&self) -> Result<Vec<Mood>, GatewayError>;
    async fn create_mood(&self, input: &NewMood) -> Result<Mood, GatewayError>;
    async fn update_mood(&self, mood_id: &str, input: &NewMood) -> Result<Mood, GatewayError>;
    async fn delete_mood(&self, mood_id: &str) -> Result<(), GatewayError>;

    async fn weekly_data(&self) -> Result<WeeklyData, GatewayError>;
    async fn user_stats(&self) -> Result<UserStats, GatewayError>;
}
