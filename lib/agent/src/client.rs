//! HTTP client for the task-execution agent.

use crate::config::AgentConfig;
use async_trait::async_trait;
use cadence_core::{Result, TaskId};
use cadence_scheduler::{AgentError, AgentGateway};
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveTask {
    task_id: TaskId,
    #[serde(default)]
    last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestActivity {
    #[serde(default)]
    last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct StartTaskRequest<'a> {
    mode: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartTaskResponse {
    task_id: TaskId,
}

/// [`AgentGateway`] over the agent's JSON HTTP API.
#[derive(Clone)]
pub struct HttpAgentGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentGateway {
    /// Creates a gateway for the agent described by `config`.
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AgentError::Transport {
                reason: format!("HTTP client error: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn active_task(&self) -> std::result::Result<Option<ActiveTask>, AgentError> {
        let response = self
            .client
            .get(self.url("/tasks/active"))
            .send()
            .await
            .map_err(request_error)?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }
}

#[async_trait]
impl AgentGateway for HttpAgentGateway {
    #[instrument(skip(self))]
    async fn has_active_task(&self) -> std::result::Result<bool, AgentError> {
        let active = self.active_task().await?;
        debug!(busy = active.is_some(), "agent state");
        Ok(active.is_some())
    }

    #[instrument(skip(self))]
    async fn last_activity_time(
        &self,
        excluding: Option<&TaskId>,
    ) -> std::result::Result<Option<DateTime<Utc>>, AgentError> {
        let mut request = self.client.get(self.url("/activity/latest"));
        if let Some(task_id) = excluding {
            request = request.query(&[("excludeTaskId", task_id.as_str())]);
        }
        let response = request.send().await.map_err(request_error)?;
        let latest: LatestActivity = decode(response).await?;
        Ok(latest.last_activity_at)
    }

    #[instrument(skip(self))]
    async fn last_activity_time_for_active_task(
        &self,
    ) -> std::result::Result<Option<DateTime<Utc>>, AgentError> {
        Ok(self
            .active_task()
            .await?
            .and_then(|task| task.last_activity_at))
    }

    #[instrument(skip(self))]
    async fn interrupt_active_task(&self) -> std::result::Result<bool, AgentError> {
        let response = self
            .client
            .post(self.url("/tasks/active/cancel"))
            .send()
            .await
            .map_err(request_error)?;
        let cancel: CancelResponse = decode(response).await?;
        debug!(cancelled = cancel.cancelled, "interrupt result");
        Ok(cancel.cancelled)
    }

    #[instrument(skip(self, instructions))]
    async fn start_task(
        &self,
        mode: &str,
        instructions: &str,
    ) -> std::result::Result<TaskId, AgentError> {
        let response = self
            .client
            .post(self.url("/tasks"))
            .json(&StartTaskRequest {
                mode,
                text: instructions,
            })
            .send()
            .await
            .map_err(request_error)?;
        let started: StartTaskResponse = decode(response).await?;
        debug!(task_id = %started.task_id, "task started");
        Ok(started.task_id)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> std::result::Result<T, AgentError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AgentError::Rejected {
            status: status.as_u16(),
            reason: if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        });
    }
    let body = response.text().await.map_err(request_error)?;
    serde_json::from_str(&body).map_err(|e| AgentError::InvalidResponse {
        reason: e.to_string(),
    })
}

fn request_error(err: reqwest::Error) -> AgentError {
    if err.is_connect() {
        AgentError::Unavailable {
            reason: err.to_string(),
        }
    } else {
        AgentError::Transport {
            reason: err.to_string(),
        }
    }
}
