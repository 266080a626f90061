//! HTTP trigger for Hourline: starts a reconciliation run, reports idle/busy
//! status and a tail of the run's log. Single-flight execution is enforced by
//! an advisory lock with a staleness expiry, so an abandoned run cannot wedge
//! the endpoint forever.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hourline_pipeline::{run_once, summary_line, RunConfig, RunSummary};
use hourline_store::{JsonFileStore, TableStore};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};

pub const CRATE_NAME: &str = "hourline-web";

const LOG_TAIL_LINES: usize = 50;
const TOKEN_HEADER: &str = "x-hourline-token";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub run_token: Option<String>,
    pub lock_stale: Duration,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("HOURLINE_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            run_token: std::env::var("HOURLINE_RUN_TOKEN").ok().filter(|t| !t.is_empty()),
            lock_stale: Duration::from_secs(
                std::env::var("HOURLINE_LOCK_STALE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1200),
            ),
        }
    }
}

pub struct AppState {
    store: Arc<dyn TableStore>,
    run_config: RunConfig,
    run_token: Option<String>,
    lock_stale: Duration,
    lock_held_since: Mutex<Option<Instant>>,
    log_tail: Mutex<VecDeque<String>>,
    last_summary: Mutex<Option<RunSummary>>,
}

impl AppState {
    pub fn new(store: Arc<dyn TableStore>, run_config: RunConfig, web: &WebConfig) -> Self {
        Self {
            store,
            run_config,
            run_token: web.run_token.clone(),
            lock_stale: web.lock_stale,
            lock_held_since: Mutex::new(None),
            log_tail: Mutex::new(VecDeque::new()),
            last_summary: Mutex::new(None),
        }
    }

    async fn log_line(&self, line: String) {
        let mut tail = self.log_tail.lock().await;
        if tail.len() == LOG_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    async fn tail(&self) -> Vec<String> {
        self.log_tail.lock().await.iter().cloned().collect()
    }

    /// Takes the run lock unless a non-stale run already holds it.
    async fn try_acquire(&self) -> bool {
        let mut held = self.lock_held_since.lock().await;
        match *held {
            Some(since) if since.elapsed() < self.lock_stale => false,
            _ => {
                *held = Some(Instant::now());
                true
            }
        }
    }

    async fn release(&self) {
        *self.lock_held_since.lock().await = None;
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/status", get(status_handler))
        .route("/run", post(run_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let run_config = RunConfig::from_env();
    let web_config = WebConfig::from_env();
    let store: Arc<dyn TableStore> = Arc::new(JsonFileStore::new(run_config.store_path.clone()));
    let state = Arc::new(AppState::new(store, run_config, &web_config));

    let listener = TcpListener::bind(("0.0.0.0", web_config.port)).await?;
    info!(port = web_config.port, "hourline trigger listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let busy = {
        let held = state.lock_held_since.lock().await;
        matches!(*held, Some(since) if since.elapsed() < state.lock_stale)
    };
    let last_run = state.last_summary.lock().await.clone();
    Json(serde_json::json!({
        "status": if busy { "busy" } else { "idle" },
        "last_run": last_run,
        "log_tail": state.tail().await,
    }))
    .into_response()
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(expected) = &state.run_token {
        let presented = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .or_else(|| query.get("token").map(String::as_str));
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "status": "error", "message": "invalid run token" })),
            )
                .into_response();
        }
    }

    if !state.try_acquire().await {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "busy",
                "message": "a reconciliation run is already in flight",
                "log_tail": state.tail().await,
            })),
        )
            .into_response();
    }

    // If this future is dropped mid-run, the lock stays held until the
    // staleness window expires.
    state.log_line("run triggered".to_string()).await;
    let outcome = run_once(state.store.as_ref(), &state.run_config).await;
    state.release().await;

    match outcome {
        Ok(summary) => {
            let message = summary_line(&summary);
            state.log_line(message.clone()).await;
            *state.last_summary.lock().await = Some(summary.clone());
            Json(serde_json::json!({
                "status": "ok",
                "message": message,
                "summary": summary,
                "log_tail": state.tail().await,
            }))
            .into_response()
        }
        Err(err) => {
            let message = format!("run failed: {err:#}");
            error!("{message}");
            state.log_line(message.clone()).await;
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "error",
                    "message": message,
                    "log_tail": state.tail().await,
                })),
            )
                .into_response()
        }
    }
}
