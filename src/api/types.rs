use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::db::{RunStatus, Task, TaskRun};

/// Typed API failure mapped onto an HTTP status. Internal detail is logged,
/// never serialised to clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Capacity(&'static str),

    #[error("{message}")]
    Internal {
        message: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ApiError {
    pub fn internal(message: &'static str, source: anyhow::Error) -> Self {
        Self::Internal { message, source }
    }

    /// Maps a store error: missing rows become 404, anything else 500.
    pub fn from_store(
        not_found_message: &'static str,
        internal_message: &'static str,
        err: anyhow::Error,
    ) -> Self {
        if crate::db::is_not_found(&err) {
            Self::NotFound(not_found_message)
        } else {
            Self::internal(internal_message, err)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, (*message).to_string()),
            ApiError::Capacity(message) => (StatusCode::SERVICE_UNAVAILABLE, (*message).to_string()),
            ApiError::Internal { message, source } => {
                error!("api error: {message}: {source:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, (*message).to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Create/update payload. Unknown fields are rejected outright.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskRequest {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub cron_expr: String,
    #[serde(default)]
    pub scheduled_at: Option<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub discord_webhook: String,
    #[serde(default)]
    pub slack_webhook: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub permission_mode: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: i64,
    pub name: String,
    pub prompt: String,
    pub cron_expr: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub is_one_off: bool,
    pub working_dir: String,
    pub discord_webhook: String,
    pub slack_webhook: String,
    pub model: String,
    pub permission_mode: String,
    pub enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<String>,
}

impl TaskResponse {
    pub fn from_task(task: &Task, status: Option<RunStatus>) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            prompt: task.prompt.clone(),
            cron_expr: task.cron_expr.clone(),
            scheduled_at: task.scheduled_at,
            is_one_off: task.is_one_off(),
            working_dir: task.working_dir.clone(),
            discord_webhook: task.discord_webhook.clone(),
            slack_webhook: task.slack_webhook.clone(),
            model: task.model.clone(),
            permission_mode: task.permission_mode.clone(),
            enabled: task.enabled,
            created_at: task.created_at,
            updated_at: task.updated_at,
            last_run_at: task.last_run_at,
            next_run_at: task.next_run_at,
            last_run_status: status.map(|s| s.as_str().to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskRunResponse {
    pub id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub output: String,
    pub error: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl TaskRunResponse {
    pub fn from_run(run: &TaskRun) -> Self {
        Self {
            id: run.id,
            task_id: run.task_id,
            started_at: run.started_at,
            ended_at: run.ended_at,
            status: run.status.as_str().to_string(),
            output: run.output.clone(),
            error: run.error.clone(),
            session_id: run.session_id.clone(),
            duration_ms: run
                .ended_at
                .map(|ended| (ended - run.started_at).num_milliseconds()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskRunsResponse {
    pub runs: Vec<TaskRunResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsRequest {
    pub usage_threshold: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub usage_threshold: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageBucketResponse {
    pub utilization: f64,
    pub resets_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub five_hour: UsageBucketResponse,
    pub seven_day: UsageBucketResponse,
}
