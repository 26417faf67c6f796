use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::warn;

use crate::db::Task;
use crate::usage::UsageClient;
use crate::version;

use super::types::{
    ApiError, HealthResponse, SettingsRequest, SettingsResponse, SuccessResponse,
    TaskListResponse, TaskRequest, TaskResponse, TaskRunResponse, TaskRunsResponse,
    UsageBucketResponse, UsageResponse,
};
use super::AppState;

const MAX_TASK_RUNS_LIMIT: usize = 200;
const DEFAULT_TASK_RUNS_LIMIT: usize = 20;

/// Strict JSON parsing: unknown fields and trailing documents are 400s.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|_| ApiError::Validation("Invalid request body".to_string()))
}

fn parse_id(raw: &str, label: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Validation(format!("Invalid {label}")))
}

fn validate_task_request(req: &mut TaskRequest) -> Result<(), ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::Validation("Name is required".to_string()));
    }
    if req.prompt.is_empty() {
        return Err(ApiError::Validation("Prompt is required".to_string()));
    }
    // Empty cron_expr marks a one-off task; otherwise it must parse as
    // 6-field (seconds) cron.
    if !req.cron_expr.is_empty() {
        let field_count = req.cron_expr.split_whitespace().count();
        if field_count != 6 || cron::Schedule::from_str(&req.cron_expr).is_err() {
            return Err(ApiError::Validation("Invalid cron expression".to_string()));
        }
    }
    if req.working_dir.is_empty() {
        req.working_dir = ".".to_string();
    }
    Ok(())
}

fn parse_scheduled_at(raw: &Option<String>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| {
                ApiError::Validation("Invalid scheduled_at format (use RFC3339)".to_string())
            }),
    }
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: version::VERSION.to_string(),
    })
}

pub async fn list_tasks(State(state): State<AppState>) -> Result<Json<TaskListResponse>, ApiError> {
    let tasks = state
        .store
        .list_tasks()
        .map_err(|err| ApiError::internal("Failed to fetch tasks", err))?;

    // Batch query; a failure here degrades the listing instead of failing it.
    let statuses = match state.store.get_last_run_statuses() {
        Ok(statuses) => statuses,
        Err(err) => {
            warn!("failed to fetch last run statuses: {err:#}");
            HashMap::new()
        }
    };

    let responses: Vec<TaskResponse> = tasks
        .iter()
        .map(|task| TaskResponse::from_task(task, statuses.get(&task.id).copied()))
        .collect();

    Ok(Json(TaskListResponse {
        total: responses.len(),
        tasks: responses,
    }))
}

pub async fn create_task(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    let mut req: TaskRequest = parse_json(&body)?;
    validate_task_request(&mut req)?;
    let scheduled_at = parse_scheduled_at(&req.scheduled_at)?;

    let mut task = Task {
        name: req.name,
        prompt: req.prompt,
        cron_expr: req.cron_expr,
        scheduled_at,
        working_dir: req.working_dir,
        discord_webhook: req.discord_webhook,
        slack_webhook: req.slack_webhook,
        model: req.model,
        permission_mode: req.permission_mode,
        enabled: req.enabled,
        ..Task::default()
    };

    state
        .store
        .create_task(&mut task)
        .map_err(|err| ApiError::internal("Failed to create task", err))?;

    if task.enabled {
        if let Some(scheduler) = &state.scheduler {
            scheduler
                .add_task(&task)
                .await
                .map_err(|err| ApiError::internal("Task created but scheduling failed", err))?;
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(TaskResponse::from_task(&task, None)),
    ))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let id = parse_id(&id, "task ID")?;
    let task = state
        .store
        .get_task(id)
        .map_err(|err| ApiError::from_store("Task not found", "Failed to fetch task", err))?;

    let status = match state.store.get_latest_task_run(id) {
        Ok(run) => Some(run.status),
        Err(err) if crate::db::is_not_found(&err) => None,
        Err(err) => return Err(ApiError::internal("Failed to fetch latest run", err)),
    };

    Ok(Json(TaskResponse::from_task(&task, status)))
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<TaskResponse>, ApiError> {
    let id = parse_id(&id, "task ID")?;
    let mut task = state
        .store
        .get_task(id)
        .map_err(|err| ApiError::from_store("Task not found", "Failed to fetch task", err))?;

    let mut req: TaskRequest = parse_json(&body)?;
    validate_task_request(&mut req)?;
    let scheduled_at = parse_scheduled_at(&req.scheduled_at)?;

    task.name = req.name;
    task.prompt = req.prompt;
    task.cron_expr = req.cron_expr;
    task.scheduled_at = scheduled_at;
    task.working_dir = req.working_dir;
    task.discord_webhook = req.discord_webhook;
    task.slack_webhook = req.slack_webhook;
    task.model = req.model;
    task.permission_mode = req.permission_mode;
    task.enabled = req.enabled;

    state
        .store
        .update_task(&task)
        .map_err(|err| ApiError::internal("Failed to update task", err))?;

    if let Some(scheduler) = &state.scheduler {
        scheduler
            .update_task(&task)
            .await
            .map_err(|err| ApiError::internal("Task updated but scheduling failed", err))?;
    }

    Ok(Json(TaskResponse::from_task(&task, None)))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let id = parse_id(&id, "task ID")?;
    state
        .store
        .get_task(id)
        .map_err(|err| ApiError::from_store("Task not found", "Failed to fetch task", err))?;

    // Cancel local schedule entries before the row disappears.
    if let Some(scheduler) = &state.scheduler {
        scheduler.remove_task(id).await;
    }

    state
        .store
        .delete_task(id)
        .map_err(|err| ApiError::internal("Failed to delete task", err))?;

    Ok(Json(SuccessResponse {
        success: true,
        message: "Task deleted".to_string(),
    }))
}

pub async fn toggle_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let id = parse_id(&id, "task ID")?;
    state
        .store
        .get_task(id)
        .map_err(|err| ApiError::from_store("Task not found", "Failed to fetch task", err))?;

    state
        .store
        .toggle_task(id)
        .map_err(|err| ApiError::internal("Failed to toggle task", err))?;

    let task = state
        .store
        .get_task(id)
        .map_err(|err| ApiError::internal("Failed to fetch task", err))?;

    if let Some(scheduler) = &state.scheduler {
        scheduler
            .update_task(&task)
            .await
            .map_err(|err| ApiError::internal("Task toggled but scheduling update failed", err))?;
    }

    Ok(Json(TaskResponse::from_task(&task, None)))
}

pub async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SuccessResponse>), ApiError> {
    let id = parse_id(&id, "task ID")?;
    let task = state
        .store
        .get_task(id)
        .map_err(|err| ApiError::from_store("Task not found", "Failed to fetch task", err))?;

    if state.run_concurrency == 0 {
        return Err(ApiError::Capacity("Task execution queue is disabled"));
    }

    let permit = state
        .run_semaphore
        .clone()
        .try_acquire_owned()
        .map_err(|_| ApiError::Capacity("Task execution queue is full"))?;

    let task_id = task.id;
    let mut rx = state.executor.execute_async(task);
    tokio::spawn(async move {
        let _permit = permit;
        if let Some(result) = rx.recv().await {
            if let Some(err) = result.error {
                warn!(task_id, "run-now task failed: {err:#}");
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SuccessResponse {
            success: true,
            message: "Task execution started".to_string(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    limit: Option<String>,
}

pub async fn get_task_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<TaskRunsResponse>, ApiError> {
    let id = parse_id(&id, "task ID")?;
    state
        .store
        .get_task(id)
        .map_err(|err| ApiError::from_store("Task not found", "Failed to fetch task", err))?;

    let limit = match query.limit.as_deref() {
        None | Some("") => DEFAULT_TASK_RUNS_LIMIT,
        Some(raw) => {
            let limit: i64 = raw.parse().map_err(|_| {
                ApiError::Validation("limit must be a positive integer".to_string())
            })?;
            if limit <= 0 {
                return Err(ApiError::Validation(
                    "limit must be a positive integer".to_string(),
                ));
            }
            let limit = limit as usize;
            if limit > MAX_TASK_RUNS_LIMIT {
                return Err(ApiError::Validation(
                    "limit exceeds maximum allowed value".to_string(),
                ));
            }
            limit
        }
    };

    let runs = state
        .store
        .get_task_runs(id, limit)
        .map_err(|err| ApiError::internal("Failed to fetch task runs", err))?;

    Ok(Json(TaskRunsResponse {
        total: runs.len(),
        runs: runs.iter().map(TaskRunResponse::from_run).collect(),
    }))
}

pub async fn get_task_run(
    State(state): State<AppState>,
    Path((id, run_id)): Path<(String, String)>,
) -> Result<Json<TaskRunResponse>, ApiError> {
    let id = parse_id(&id, "task ID")?;
    let run_id = parse_id(&run_id, "run ID")?;

    let run = state
        .store
        .get_task_run(id, run_id)
        .map_err(|err| ApiError::from_store("Run not found", "Failed to fetch run", err))?;

    Ok(Json(TaskRunResponse::from_run(&run)))
}

pub async fn get_latest_task_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskRunResponse>, ApiError> {
    let id = parse_id(&id, "task ID")?;
    let run = state
        .store
        .get_latest_task_run(id)
        .map_err(|err| ApiError::from_store("No runs found", "Failed to fetch latest run", err))?;

    Ok(Json(TaskRunResponse::from_run(&run)))
}

pub async fn get_settings(
    State(state): State<AppState>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let usage_threshold = state
        .store
        .get_usage_threshold()
        .map_err(|err| ApiError::internal("Failed to fetch settings", err))?;

    Ok(Json(SettingsResponse { usage_threshold }))
}

pub async fn update_settings(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SettingsResponse>, ApiError> {
    let req: SettingsRequest = parse_json(&body)?;

    if !(0.0..=100.0).contains(&req.usage_threshold) {
        return Err(ApiError::Validation(
            "Usage threshold must be between 0 and 100".to_string(),
        ));
    }

    state
        .store
        .set_usage_threshold(req.usage_threshold)
        .map_err(|err| ApiError::internal("Failed to update settings", err))?;

    Ok(Json(SettingsResponse {
        usage_threshold: req.usage_threshold,
    }))
}

pub async fn get_usage(State(_state): State<AppState>) -> Result<Json<UsageResponse>, ApiError> {
    let client = UsageClient::new()
        .map_err(|err| ApiError::internal("Usage client not available", err))?;

    let snapshot = client
        .fetch()
        .await
        .map_err(|err| ApiError::internal("Failed to fetch usage", err))?;

    Ok(Json(UsageResponse {
        five_hour: UsageBucketResponse {
            utilization: snapshot.five_hour.utilization,
            resets_at: snapshot.five_hour.resets_at,
        },
        seven_day: UsageBucketResponse {
            utilization: snapshot.seven_day.utilization,
            resets_at: snapshot.seven_day.resets_at,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> TaskRequest {
        TaskRequest {
            name: "check".to_string(),
            prompt: "do it".to_string(),
            cron_expr: String::new(),
            scheduled_at: None,
            working_dir: String::new(),
            discord_webhook: String::new(),
            slack_webhook: String::new(),
            model: String::new(),
            permission_mode: String::new(),
            enabled: true,
        }
    }

    #[test]
    fn validation_requires_name_and_prompt() {
        let mut req = base_request();
        req.name = String::new();
        assert!(validate_task_request(&mut req).is_err());

        let mut req = base_request();
        req.prompt = String::new();
        assert!(validate_task_request(&mut req).is_err());
    }

    #[test]
    fn validation_defaults_working_dir() {
        let mut req = base_request();
        validate_task_request(&mut req).unwrap();
        assert_eq!(req.working_dir, ".");
    }

    #[test]
    fn validation_accepts_six_field_cron() {
        let mut req = base_request();
        req.cron_expr = "0 */5 * * * *".to_string();
        assert!(validate_task_request(&mut req).is_ok());
    }

    #[test]
    fn validation_rejects_five_field_cron() {
        let mut req = base_request();
        req.cron_expr = "*/5 * * * *".to_string();
        assert!(validate_task_request(&mut req).is_err());
    }

    #[test]
    fn validation_rejects_garbage_cron() {
        let mut req = base_request();
        req.cron_expr = "not a cron at all x".to_string();
        assert!(validate_task_request(&mut req).is_err());
    }

    #[test]
    fn scheduled_at_requires_rfc3339() {
        assert!(parse_scheduled_at(&Some("2026-03-01T10:00:00Z".to_string()))
            .unwrap()
            .is_some());
        assert!(parse_scheduled_at(&Some("tomorrow".to_string())).is_err());
        assert!(parse_scheduled_at(&Some(String::new())).unwrap().is_none());
        assert!(parse_scheduled_at(&None).unwrap().is_none());
    }

    #[test]
    fn parse_json_rejects_unknown_fields_and_trailing_documents() {
        let unknown = Bytes::from_static(br#"{"name":"x","prompt":"y","bogus":1}"#);
        assert!(parse_json::<TaskRequest>(&unknown).is_err());

        let trailing = Bytes::from_static(br#"{"name":"x","prompt":"y"} {"again":true}"#);
        assert!(parse_json::<TaskRequest>(&trailing).is_err());

        let valid = Bytes::from_static(br#"{"name":"x","prompt":"y"}"#);
        assert!(parse_json::<TaskRequest>(&valid).is_ok());
    }
}
