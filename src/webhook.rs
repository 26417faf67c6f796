//! Webhook notifiers invoked by the executor after every run. Delivery
//! failures are reported to the caller but never affect the run outcome.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::db::{RunStatus, Task, TaskRun};
use crate::version;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EXCERPT_LIMIT: usize = 500;

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(version::user_agent())
        .build()
        .unwrap_or_default()
}

fn summarize(task: &Task, run: &TaskRun) -> String {
    let status_icon = match run.status {
        RunStatus::Completed => "✅",
        RunStatus::Failed => "❌",
        _ => "⏳",
    };
    let duration = run
        .ended_at
        .map(|ended| format!("{}s", (ended - run.started_at).num_seconds()))
        .unwrap_or_else(|| "-".to_string());

    let mut summary = format!(
        "{status_icon} Task \"{}\" {} in {duration}",
        task.name, run.status
    );

    let detail = if run.status == RunStatus::Failed {
        &run.error
    } else {
        &run.output
    };
    if !detail.is_empty() {
        summary.push('\n');
        summary.push_str(&excerpt(detail));
    }
    summary
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_LIMIT {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_LIMIT).collect();
    format!("{cut}…")
}

/// Posts run summaries to a Discord webhook URL.
pub struct Discord {
    http: reqwest::Client,
}

impl Discord {
    pub fn new() -> Self {
        Self {
            http: http_client(),
        }
    }

    pub async fn send_result(&self, url: &str, task: &Task, run: &TaskRun) -> Result<()> {
        let payload = serde_json::json!({ "content": summarize(task, run) });
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("failed to send discord webhook")?;

        let status = response.status();
        anyhow::ensure!(
            status.is_success(),
            "discord webhook returned status {status}"
        );
        Ok(())
    }
}

/// Posts run summaries to a Slack incoming-webhook URL.
pub struct Slack {
    http: reqwest::Client,
}

impl Slack {
    pub fn new() -> Self {
        Self {
            http: http_client(),
        }
    }

    pub async fn send_result(&self, url: &str, task: &Task, run: &TaskRun) -> Result<()> {
        let payload = serde_json::json!({ "text": summarize(task, run) });
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("failed to send slack webhook")?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "slack webhook returned status {status}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completed_run(task_id: i64) -> TaskRun {
        let started = Utc::now();
        TaskRun {
            id: 1,
            task_id,
            started_at: started,
            ended_at: Some(started + chrono::Duration::seconds(3)),
            status: RunStatus::Completed,
            output: "all good".to_string(),
            ..TaskRun::default()
        }
    }

    fn task_named(name: &str) -> Task {
        Task {
            id: 1,
            name: name.to_string(),
            ..Task::default()
        }
    }

    #[tokio::test]
    async fn discord_posts_content_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_string_contains("content"))
            .and(body_string_contains("notify"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let discord = Discord::new();
        discord
            .send_result(
                &format!("{}/hook", server.uri()),
                &task_named("notify"),
                &completed_run(1),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn slack_posts_text_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_string_contains("text"))
            .and(body_string_contains("notify"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let slack = Slack::new();
        slack
            .send_result(
                &format!("{}/hook", server.uri()),
                &task_named("notify"),
                &completed_run(1),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let discord = Discord::new();
        let err = discord
            .send_result(
                &format!("{}/hook", server.uri()),
                &task_named("notify"),
                &completed_run(1),
            )
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("500"));
    }

    #[test]
    fn failed_runs_surface_error_excerpt() {
        let task = task_named("broken");
        let mut run = completed_run(1);
        run.status = RunStatus::Failed;
        run.error = "x".repeat(2000);

        let summary = summarize(&task, &run);
        assert!(summary.contains("failed"));
        assert!(summary.chars().count() < 600);
        assert!(summary.ends_with('…'));
    }
}
