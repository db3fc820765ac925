//! reqwest-backed implementation of [`Gateway`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::{Gateway, UserStats, WeeklyData};
use crate::error::GatewayError;
use crate::model::{Break, Mood, NewBreak, NewMood, NewTask, Task, TaskCompletion};
use crate::storage::ApiConfig;

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl HttpGateway {
    /// # Errors
    /// Returns an error if `base_url` is not an absolute URL or the HTTP
    /// client cannot be built.
    pub fn new(config: &ApiConfig, token: impl Into<String>) -> Result<Self, GatewayError> {
        url::Url::parse(&config.base_url)
            .map_err(|e| GatewayError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            timeout: config.timeout(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, GatewayError> {
        let raw = format!("{}{}", self.base_url, path);
        Url::parse(&raw).map_err(|e| GatewayError::InvalidUrl(format!("{raw}: {e}")))
    }

    /// `path` followed by `id` as one percent-encoded segment.
    fn item_url(&self, path: &str, id: &str) -> Result<Url, GatewayError> {
        let mut url = self.url(path)?;
        if url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(format!("{url}: cannot hold a path")));
        }
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(id);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<reqwest::Response, GatewayError> {
        debug!(%method, %url, "gateway request");
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(result) => result.map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout {
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    GatewayError::from(e)
                }
            })?,
            Err(_) => {
                return Err(GatewayError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<T, GatewayError> {
        let response = self.send(method, url, body).await?;
        let bytes = response.bytes().await.map_err(GatewayError::from)?;
        serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn empty(&self, method: Method, url: Url) -> Result<(), GatewayError> {
        self.send(method, url, None).await.map(|_| ())
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<String, GatewayError> {
    serde_json::to_string(value).map_err(|e| GatewayError::Decode(e.to_string()))
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn list_tasks(&self) -> Result<Vec<Task>, GatewayError> {
        self.json(Method::GET, self.url("/tasks")?, None).await
    }

    async fn upcoming_tasks(&self) -> Result<Vec<Task>, GatewayError> {
        self.json(Method::GET, self.url("/tasks/upcoming")?, None).await
    }

    async fn create_task(&self, input: &NewTask) -> Result<Task, GatewayError> {
        self.json(Method::POST, self.url("/tasks")?, Some(to_body(input)?)).await
    }

    async fn complete_task(
        &self,
        task_id: &str,
        completion: &TaskCompletion,
    ) -> Result<Task, GatewayError> {
        let url = self.item_url("/tasks", task_id)?;
        self.json(Method::PATCH, url, Some(to_body(completion)?)).await
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), GatewayError> {
        self.empty(Method::DELETE, self.item_url("/tasks", task_id)?)
            .await
    }

    async fn list_breaks(&self) -> Result<Vec<Break>, GatewayError> {
        self.json(Method::GET, self.url("/break")?, None).await
    }

    async fn create_break(&self, input: &NewBreak) -> Result<Break, GatewayError> {
        self.json(Method::POST, self.url("/break")?, Some(to_body(input)?)).await
    }

    async fn list_moods(&self) -> Result<Vec<Mood>, GatewayError> {
        self.json(Method::GET, self.url("/mood")?, None).await
    }

    async fn create_mood(&self, input: &NewMood) -> Result<Mood, GatewayError> {
        self.json(Method::POST, self.url("/mood")?, Some(to_body(input)?)).await
    }

    async fn update_mood(&self, mood_id: &str, input: &NewMood) -> Result<Mood, GatewayError> {
        let url = self.item_url("/mood", mood_id)?;
        self.json(Method::PUT, url, Some(to_body(input)?)).await
    }

    async fn delete_mood(&self, mood_id: &str) -> Result<(), GatewayError> {
        self.empty(Method::DELETE, self.item_url("/mood", mood_id)?)
            .await
    }

    async fn weekly_data(&self) -> Result<WeeklyData, GatewayError> {
        self.json(Method::GET, self.url("/api/dashboard/weekly-data")?, None)
            .await
    }

    async fn user_stats(&self) -> Result<UserStats, GatewayError> {
        self.json(Method::GET, self.url("/api/dashboard/user-stats")?, None)
            .await
    }
}
