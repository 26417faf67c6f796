//! HTTP API surface: a thin axum layer over the store, scheduler, and
//! executor. Handlers own no state beyond `AppState`.

mod handlers;
mod middleware;
pub mod types;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::config;
use crate::db::Store;
use crate::executor::Executor;
use crate::scheduler::Scheduler;

/// Request bodies beyond this are refused before JSON parsing.
pub const MAX_JSON_BODY_BYTES: usize = 1 << 20;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub scheduler: Option<Arc<Scheduler>>,
    pub executor: Arc<Executor>,
    pub run_semaphore: Arc<Semaphore>,
    pub run_concurrency: usize,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        scheduler: Option<Arc<Scheduler>>,
        data_dir: impl AsRef<Path>,
        run_concurrency: usize,
    ) -> Self {
        let executor = Arc::new(Executor::new(Arc::clone(&store), data_dir));
        Self {
            store,
            scheduler,
            executor,
            run_semaphore: Arc::new(Semaphore::new(run_concurrency)),
            run_concurrency,
        }
    }
}

/// Environment-derived API settings, injectable for tests.
#[derive(Debug, Clone, Default)]
pub struct ApiConfig {
    pub auth_token: Option<String>,
    pub cors_origin: Option<String>,
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            auth_token: read(config::AUTH_TOKEN_ENV),
            cors_origin: read(config::CORS_ORIGIN_ENV),
        }
    }
}

pub fn router(state: AppState, api_config: &ApiConfig) -> Router {
    let routes = Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route(
            "/api/v1/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route(
            "/api/v1/tasks/:id",
            get(handlers::get_task)
                .put(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route("/api/v1/tasks/:id/toggle", post(handlers::toggle_task))
        .route("/api/v1/tasks/:id/run", post(handlers::run_task))
        .route("/api/v1/tasks/:id/runs", get(handlers::get_task_runs))
        .route(
            "/api/v1/tasks/:id/runs/latest",
            get(handlers::get_latest_task_run),
        )
        .route(
            "/api/v1/tasks/:id/runs/:run_id",
            get(handlers::get_task_run),
        )
        .route(
            "/api/v1/settings",
            get(handlers::get_settings).put(handlers::update_settings),
        )
        .route("/api/v1/usage", get(handlers::get_usage))
        .with_state(state);

    let auth_token = api_config.auth_token.clone();
    let cors_origin = api_config.cors_origin.clone();

    // Outermost to innermost: body limit, CORS (answers preflights before
    // auth runs), then auth.
    routes
        .layer(axum::middleware::from_fn(move |request, next| {
            let token = auth_token.clone();
            async move { middleware::auth(token, request, next).await }
        }))
        .layer(axum::middleware::from_fn(move |request, next| {
            let origin = cors_origin.clone();
            async move { middleware::cors(origin, request, next).await }
        }))
        .layer(RequestBodyLimitLayer::new(MAX_JSON_BODY_BYTES))
}

/// Binds the API server and runs it until ctrl-c.
pub async fn serve(state: AppState, api_config: &ApiConfig, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind API listener on port {port}"))?;

    info!(port, "API server listening");

    axum::serve(listener, router(state, api_config))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("API server error")
}
