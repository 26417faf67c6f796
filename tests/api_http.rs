//! End-to-end API tests against a real listener on an ephemeral port.

use std::sync::Arc;

use claude_tasks::api::{router, ApiConfig, AppState};
use claude_tasks::db::{RunStatus, Store, Task, TaskRun};
use serde_json::{json, Value};
use tempfile::TempDir;

struct TestServer {
    base_url: String,
    store: Arc<Store>,
    _data_dir: TempDir,
}

async fn spawn_server(config: ApiConfig, run_concurrency: usize) -> TestServer {
    let data_dir = TempDir::new().expect("temp data dir");
    let store = Arc::new(Store::open(data_dir.path().join("tasks.db")).expect("open store"));

    let state = AppState::new(Arc::clone(&store), None, data_dir.path(), run_concurrency);
    let app = router(state, &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral listener");
    let addr = listener.local_addr().expect("listener address");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve API");
    });

    TestServer {
        base_url: format!("http://{addr}"),
        store,
        _data_dir: data_dir,
    }
}

async fn default_server() -> TestServer {
    spawn_server(ApiConfig::default(), 4).await
}

fn task_payload(name: &str) -> Value {
    json!({
        "name": name,
        "prompt": "echo hi",
        "cron_expr": "0 * * * * *",
        "working_dir": ".",
        "enabled": true,
    })
}

fn seed_task(store: &Store, name: &str) -> Task {
    let mut task = Task {
        name: name.to_string(),
        prompt: "echo hi".to_string(),
        cron_expr: "0 * * * * *".to_string(),
        working_dir: ".".to_string(),
        enabled: true,
        ..Task::default()
    };
    store.create_task(&mut task).expect("seed task");
    task
}

fn seed_run(store: &Store, task_id: i64, status: RunStatus) -> TaskRun {
    let started = chrono::Utc::now();
    let mut run = TaskRun {
        task_id,
        started_at: started,
        ended_at: status.is_terminal().then(|| started + chrono::Duration::seconds(1)),
        status,
        output: "out".to_string(),
        ..TaskRun::default()
    };
    store.create_task_run(&mut run).expect("seed run");
    run
}

#[tokio::test]
async fn health_reports_status_and_version() {
    let server = default_server().await;

    let body: Value = reqwest::get(format!("{}/api/v1/health", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert!(body["version"].as_str().is_some());
}

#[tokio::test]
async fn create_task_and_list_tasks() {
    let server = default_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/tasks", server.base_url))
        .json(&task_payload("created-via-api"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let created: Value = response.json().await.unwrap();
    assert!(created["id"].as_i64().unwrap() > 0);
    assert_eq!(created["name"], "created-via-api");
    assert_eq!(created["is_one_off"], false);

    let listing: Value = client
        .get(format!("{}/api/v1/tasks", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["tasks"][0]["name"], "created-via-api");
}

#[tokio::test]
async fn list_includes_last_run_status_from_batch_query() {
    let server = default_server().await;
    let task = seed_task(&server.store, "with-status");
    seed_run(&server.store, task.id, RunStatus::Completed);

    let listing: Value = reqwest::get(format!("{}/api/v1/tasks", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(listing["tasks"][0]["last_run_status"], "completed");
}

#[tokio::test]
async fn get_missing_task_returns_404() {
    let server = default_server().await;

    let response = reqwest::get(format!("{}/api/v1/tasks/999", server.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Task not found");
}

#[tokio::test]
async fn non_numeric_task_id_returns_400() {
    let server = default_server().await;

    let response = reqwest::get(format!("{}/api/v1/tasks/banana", server.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid task ID");
}

#[tokio::test]
async fn create_task_rejects_unknown_fields() {
    let server = default_server().await;
    let client = reqwest::Client::new();

    let mut payload = task_payload("bad");
    payload["surprise"] = json!(true);

    let response = client
        .post(format!("{}/api/v1/tasks", server.base_url))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid request body");
}

#[tokio::test]
async fn create_task_rejects_trailing_json_payload() {
    let server = default_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/tasks", server.base_url))
        .header("Content-Type", "application/json")
        .body(r#"{"name":"x","prompt":"y"} {"another":"doc"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn create_task_rejects_invalid_cron_and_scheduled_at() {
    let server = default_server().await;
    let client = reqwest::Client::new();

    let mut payload = task_payload("bad-cron");
    payload["cron_expr"] = json!("*/5 * * * *");
    let response = client
        .post(format!("{}/api/v1/tasks", server.base_url))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid cron expression");

    let mut payload = task_payload("bad-time");
    payload["cron_expr"] = json!("");
    payload["scheduled_at"] = json!("next tuesday");
    let response = client
        .post(format!("{}/api/v1/tasks", server.base_url))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid scheduled_at format (use RFC3339)");
}

#[tokio::test]
async fn update_task_persists_changes() {
    let server = default_server().await;
    let task = seed_task(&server.store, "original");
    let client = reqwest::Client::new();

    let mut payload = task_payload("renamed");
    payload["enabled"] = json!(false);
    let response = client
        .put(format!("{}/api/v1/tasks/{}", server.base_url, task.id))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let updated = server.store.get_task(task.id).unwrap();
    assert_eq!(updated.name, "renamed");
    assert!(!updated.enabled);
}

#[tokio::test]
async fn toggle_task_flips_enabled() {
    let server = default_server().await;
    let task = seed_task(&server.store, "toggleable");
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/tasks/{}/toggle", server.base_url, task.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["enabled"], false);
    assert!(!server.store.get_task(task.id).unwrap().enabled);
}

#[tokio::test]
async fn delete_task_removes_it() {
    let server = default_server().await;
    let task = seed_task(&server.store, "doomed");
    let client = reqwest::Client::new();

    let response = client
        .delete(format!("{}/api/v1/tasks/{}", server.base_url, task.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/api/v1/tasks/{}", server.base_url, task.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn task_runs_listing_validates_limit() {
    let server = default_server().await;
    let task = seed_task(&server.store, "with-runs");

    let client = reqwest::Client::new();
    let base = format!("{}/api/v1/tasks/{}/runs", server.base_url, task.id);

    let response = client.get(format!("{base}?limit=0")).send().await.unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "limit must be a positive integer");

    let response = client.get(format!("{base}?limit=500")).send().await.unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "limit exceeds maximum allowed value");

    let response = client.get(format!("{base}?limit=abc")).send().await.unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn task_runs_listing_honours_limit_and_order() {
    let server = default_server().await;
    let task = seed_task(&server.store, "with-many-runs");
    for _ in 0..5 {
        seed_run(&server.store, task.id, RunStatus::Completed);
    }

    let body: Value = reqwest::get(format!(
        "{}/api/v1/tasks/{}/runs?limit=2",
        server.base_url, task.id
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(body["total"], 2);
    let first = body["runs"][0]["id"].as_i64().unwrap();
    let second = body["runs"][1]["id"].as_i64().unwrap();
    assert!(first > second, "runs should be most recent first");
}

#[tokio::test]
async fn get_specific_run_and_latest_run() {
    let server = default_server().await;
    let task = seed_task(&server.store, "specific");
    let older = seed_run(&server.store, task.id, RunStatus::Failed);
    let newer = seed_run(&server.store, task.id, RunStatus::Completed);

    let body: Value = reqwest::get(format!(
        "{}/api/v1/tasks/{}/runs/{}",
        server.base_url, task.id, older.id
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(body["id"].as_i64(), Some(older.id));
    assert_eq!(body["status"], "failed");

    let body: Value = reqwest::get(format!(
        "{}/api/v1/tasks/{}/runs/latest",
        server.base_url, task.id
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(body["id"].as_i64(), Some(newer.id));
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn latest_run_returns_404_when_none_exist() {
    let server = default_server().await;
    let task = seed_task(&server.store, "no-runs");

    let response = reqwest::get(format!(
        "{}/api/v1/tasks/{}/runs/latest",
        server.base_url, task.id
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 404);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No runs found");
}

#[tokio::test]
async fn run_now_returns_503_when_queue_disabled() {
    let server = spawn_server(ApiConfig::default(), 0).await;
    let task = seed_task(&server.store, "cannot-run");

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/tasks/{}/run", server.base_url, task.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Task execution queue is disabled");
}

#[tokio::test]
async fn settings_round_trip_and_validation() {
    let server = default_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/settings", server.base_url);

    let body: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["usage_threshold"], 80.0);

    let response = client
        .put(&url)
        .json(&json!({"usage_threshold": 65.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["usage_threshold"], 65.0);

    let response = client
        .put(&url)
        .json(&json!({"usage_threshold": 150.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn auth_middleware_guards_everything_but_health() {
    let config = ApiConfig {
        auth_token: Some("sekrit".to_string()),
        cors_origin: None,
    };
    let server = spawn_server(config, 4).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/v1/tasks", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Unauthorized");

    let response = client
        .get(format!("{}/api/v1/tasks", server.base_url))
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(format!("{}/api/v1/tasks", server.base_url))
        .header("Authorization", "Bearer sekrit")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Health stays open for probes.
    let response = client
        .get(format!("{}/api/v1/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn cors_allows_configured_origin_and_rejects_others() {
    let config = ApiConfig {
        auth_token: None,
        cors_origin: Some("https://app.example.com".to_string()),
    };
    let server = spawn_server(config, 4).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/v1/tasks", server.base_url))
        .header("Origin", "https://evil.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = client
        .get(format!("{}/api/v1/tasks", server.base_url))
        .header("Origin", "https://app.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("Access-Control-Allow-Origin")
            .and_then(|v| v.to_str().ok()),
        Some("https://app.example.com")
    );

    let response = client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/api/v1/tasks", server.base_url),
        )
        .header("Origin", "https://app.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn cors_defaults_to_wildcard_without_configured_origin() {
    let server = default_server().await;

    let response = reqwest::get(format!("{}/api/v1/tasks", server.base_url))
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get("Access-Control-Allow-Origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}
