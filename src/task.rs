//! Remote task client
//!
//! The backend runs a chat turn as an asynchronous job: submit it, then poll
//! until it reaches a terminal status or the deadline passes.

use crate::config::Timings;
use crate::error::{BridgeError, Result};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_URL: &str = "https://api.manus.ai/v1";
pub const DEFAULT_PROFILE: &str = "manus-1.6";
pub const LITE_PROFILE: &str = "manus-1.6-lite";
pub const EMPTY_OUTPUT: &str = "(No text output)";

const API_KEY_HEADER: &str = "API_KEY";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Anything the backend adds later; treated as still in progress
    Other,
}

impl From<&str> for TaskStatus {
    fn from(s: &str) -> Self {
        match s {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Other,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest<'a> {
    prompt: &'a str,
    agent_profile: &'a str,
    task_mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    task_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSnapshot {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Vec<TaskMessage>,
}

impl TaskSnapshot {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from(self.status.as_str())
    }
}

/// Result of a finished chat task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReply {
    pub task_id: String,
    pub text: String,
}

/// Join every assistant text segment in order
pub fn assistant_text(output: &[TaskMessage]) -> String {
    let segments: Vec<&str> = output
        .iter()
        .filter(|m| m.role == "assistant")
        .flat_map(|m| m.content.iter())
        .filter_map(|c| c.text.as_deref())
        .filter(|t| !t.is_empty())
        .collect();

    let joined = segments.join("\n\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        EMPTY_OUTPUT.to_string()
    } else {
        trimmed.to_string()
    }
}

fn head(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub struct TaskClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timings: Timings,
}

impl TaskClient {
    pub fn new(api_key: &str, timings: Timings) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, api_key, timings)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: &str,
        timings: Timings,
    ) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(BridgeError::Api("Manus API key is required".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timings,
        })
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BridgeError::Api(format!(
                "Manus API {}: {}",
                status.as_u16(),
                head(&text, 300)
            )));
        }

        serde_json::from_str(&text).map_err(|_| {
            BridgeError::Api(format!("Manus API invalid JSON: {}", head(&text, 200)))
        })
    }

    /// Create a task. Passing an existing id continues that conversation.
    pub async fn submit(
        &self,
        prompt: &str,
        profile: &str,
        existing_task_id: Option<&str>,
    ) -> Result<String> {
        let body = CreateTaskRequest {
            prompt,
            agent_profile: if profile.is_empty() { DEFAULT_PROFILE } else { profile },
            task_mode: "chat",
            task_id: existing_task_id,
        };
        let url = format!("{}/tasks", self.base_url);
        let created: CreateTaskResponse = self.send(self.http.post(url).json(&body)).await?;
        log::info!(
            "[Manus] Task submitted: {} (profile {})",
            created.task_id,
            body.agent_profile
        );
        Ok(created.task_id)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskSnapshot> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        self.send(self.http.get(url)).await
    }

    /// Poll until the task completes, fails, or `task_deadline` passes since `submitted_at`
    pub async fn poll_to_completion(
        &self,
        task_id: &str,
        submitted_at: Instant,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let deadline = self.timings.task_deadline;

        while submitted_at.elapsed() < deadline {
            if cancel.is_cancelled() {
                log::info!("[Manus] Task {} cancelled", task_id);
                return Err(BridgeError::Cancelled);
            }

            let remaining = deadline.saturating_sub(submitted_at.elapsed());
            let task = match tokio::time::timeout(remaining, self.get_task(task_id)).await {
                Ok(task) => task?,
                Err(_) => {
                    log::warn!("[Manus] Task {} poll still pending at the deadline", task_id);
                    break;
                }
            };
            match task.status() {
                TaskStatus::Completed => return Ok(assistant_text(&task.output)),
                TaskStatus::Failed => {
                    let message = task
                        .error
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "task failed".to_string());
                    log::warn!("[Manus] Task {} failed: {}", task_id, message);
                    return Err(BridgeError::TaskFailed(message));
                }
                status => log::debug!("[Manus] Task {} is {:?}", task_id, status),
            }

            let remaining = deadline.saturating_sub(submitted_at.elapsed());
            tokio::time::sleep(self.timings.task_poll_interval.min(remaining)).await;
        }

        Err(BridgeError::TaskTimeout(deadline.as_secs()))
    }

    /// Submit a prompt and wait for the reply
    pub async fn chat(
        &self,
        prompt: &str,
        profile: &str,
        existing_task_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TaskReply> {
        if prompt.trim().is_empty() {
            return Err(BridgeError::Api("No message found to send to Manus API".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let deadline = self.timings.task_deadline;
        let submitted_at = Instant::now();
        let submitted = self.submit(prompt, profile, existing_task_id);
        let task_id = tokio::time::timeout(deadline, submitted)
            .await
            .map_err(|_| BridgeError::TaskTimeout(deadline.as_secs()))??;
        let text = self.poll_to_completion(&task_id, submitted_at, cancel).await?;
        Ok(TaskReply { task_id, text })
    }
}
