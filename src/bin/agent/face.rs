//! HTTP surface: REST for commands and status, SSE for live events.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use seek_agent::error::StartError;
use seek_agent::{AgentEvent, MonitorSpec, Orchestrator, StrategyKind, TaskId};

type AppState = Arc<Orchestrator>;

#[derive(Deserialize)]
struct SubmitTask {
    prompt: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    max_retries: Option<u32>,
}

#[derive(Deserialize)]
struct QuickSeek {
    query: String,
    #[serde(default)]
    screenshot: Option<String>,
}

#[derive(Deserialize)]
struct StopQuery {
    #[serde(default)]
    strategy: Option<StrategyKind>,
}

#[derive(Deserialize)]
struct ScreenshotUpdate {
    screenshot: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<StartError> for ApiError {
    fn from(err: StartError) -> Self {
        let status = match err {
            StartError::Config(_) => StatusCode::BAD_REQUEST,
            StartError::AlreadyActive { .. } => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(orchestrator: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/tasks", post(submit_task))
        .route("/monitors/{task_id}", post(start_monitor))
        .route("/monitors/{task_id}/screenshot", post(update_screenshot))
        .route("/stop/{task_id}", post(stop))
        .route("/status/{task_id}", get(status))
        .route("/events/{task_id}", get(events))
        .route("/history/{task_id}", get(history).delete(clear_history))
        .route("/memory/{task_id}", get(memory))
        .route("/quick-seek", post(quick_seek))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(orchestrator)
}

/// Bind the configured address, falling back to the next nine ports when it
/// is taken.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let base: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid bind address {addr}"))?;
    for offset in 0..10u16 {
        let Some(port) = base.port().checked_add(offset) else {
            break;
        };
        let candidate = SocketAddr::new(base.ip(), port);
        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(err) => warn!(%candidate, error = %err, "port unavailable"),
        }
    }
    Err(anyhow!(
        "could not bind any port from {addr} upwards; stop the old agent first"
    ))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "service": "seek-agent", "status": "ok" }))
}

async fn submit_task(
    State(orchestrator): State<AppState>,
    Json(payload): Json<SubmitTask>,
) -> impl IntoResponse {
    let submission = orchestrator.submit_task(
        payload.prompt,
        payload.task_id.map(TaskId::from),
        payload.max_retries,
    );
    (
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": submission.task_id })),
    )
}

async fn start_monitor(
    State(orchestrator): State<AppState>,
    Path(task_id): Path<String>,
    Json(spec): Json<MonitorSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::from(task_id);
    let handle = orchestrator.start_monitor(&task_id, &spec)?;
    info!(task_id = %task_id, strategy = %handle.key.strategy, "monitor started over HTTP");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "task_id": task_id,
            "strategy": handle.key.strategy,
            "continuous": spec.continuous,
        })),
    ))
}

async fn update_screenshot(
    State(orchestrator): State<AppState>,
    Path(task_id): Path<String>,
    Json(payload): Json<ScreenshotUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::from(task_id);
    if !orchestrator.update_screenshot(&task_id, payload.screenshot) {
        return Err(ApiError::not_found(format!(
            "no chart or vision monitor running for task {task_id}"
        )));
    }
    Ok(Json(json!({ "task_id": task_id, "updated": true })))
}

/// `?strategy=` narrows the stop to one monitor of the task.
async fn stop(
    State(orchestrator): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Json<serde_json::Value> {
    let task_id = TaskId::from(task_id);
    let stopped = match query.strategy {
        Some(strategy) => orchestrator.stop_strategy(&task_id, strategy),
        None => orchestrator.stop(&task_id),
    };
    Json(json!({ "task_id": task_id, "stopped": stopped }))
}

async fn status(
    State(orchestrator): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    Json(orchestrator.status(&TaskId::from(task_id)))
}

async fn events(
    State(orchestrator): State<AppState>,
    Path(task_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = orchestrator.subscribe(&TaskId::from(task_id));
    let stream = UnboundedReceiverStream::new(subscription.receiver)
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &AgentEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.type_name()).data(data)
}

async fn history(
    State(orchestrator): State<AppState>,
    Path(task_id): Path<String>,
) -> Json<serde_json::Value> {
    let task_id = TaskId::from(task_id);
    let results = orchestrator.history(&task_id);
    Json(json!({ "task_id": task_id, "count": results.len(), "results": results }))
}

async fn clear_history(
    State(orchestrator): State<AppState>,
    Path(task_id): Path<String>,
) -> Json<serde_json::Value> {
    let task_id = TaskId::from(task_id);
    let cleared = orchestrator.clear_history(&task_id);
    Json(json!({ "task_id": task_id, "cleared": cleared }))
}

async fn memory(
    State(orchestrator): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::from(task_id);
    orchestrator
        .memory(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no memory for task {task_id}")))
}

async fn quick_seek(
    State(orchestrator): State<AppState>,
    Json(payload): Json<QuickSeek>,
) -> Result<impl IntoResponse, ApiError> {
    let report = orchestrator
        .quick_seek(&payload.query, payload.screenshot)
        .await?;
    Ok(Json(report))
}
