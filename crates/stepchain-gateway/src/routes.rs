use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::info;

use stepchain_core::types::{RunId, RunSnapshot};
use stepchain_engine::controller::parse_step;
use stepchain_engine::{AfterResponse, StepOutcome};

use crate::error::ApiError;
use crate::state::AppState;

const NDJSON: &str = "application/x-ndjson";

/// Parse an optional JSON body, treating empty or malformed input as `{}`.
fn lenient_body<T: DeserializeOwned + Default>(body: &Bytes) -> T {
    serde_json::from_slice(body).unwrap_or_default()
}

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Default, Deserialize)]
struct StepBody {
    #[serde(default, rename = "runId")]
    run_id: Option<String>,
}

// POST /api/chained/{step}, body { runId? }
pub async fn chained_step(
    State(state): State<Arc<AppState>>,
    Extension(deferred): Extension<AfterResponse>,
    Path(step): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let step = parse_step(&step, state.controller.total_steps())?;
    let request: StepBody = lenient_body(&body);
    let run_id = request
        .run_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(|id| RunId::from_string(&id));

    let outcome = state.controller.handle(step, run_id, &deferred).await?;
    let status = match outcome {
        StepOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        StepOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

#[derive(Deserialize)]
pub struct StatusQuery {
    #[serde(default, rename = "runId")]
    pub run_id: Option<String>,
}

// GET /api/chained/status?runId=
pub async fn chained_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatusQuery>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(state.lifecycle.get_status(q.run_id.as_deref()).await?))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub scenario: Option<String>,
}

// GET /api/runs?limit=&scenario=
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let runs = state
        .lifecycle
        .list_runs(q.limit.as_deref(), q.scenario.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

// GET /api/runs/{runId}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(state.lifecycle.get_status(Some(&run_id)).await?))
}

#[derive(Default, Deserialize)]
struct KillBody {
    #[serde(default)]
    message: Option<String>,
}

// POST /api/runs/{runId}/kill, body { message? }
pub async fn kill_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: KillBody = lenient_body(&body);
    let run = state
        .lifecycle
        .kill(&run_id, request.message.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "run": run })))
}

// POST /api/sequential
pub async fn sequential(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    stream_run(&state, false).await
}

// POST /api/sequential-with-race
pub async fn sequential_with_race(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    stream_run(&state, true).await
}

async fn stream_run(state: &AppState, race: bool) -> Result<Response, ApiError> {
    let (run_id, events) = state.sequential.start(race).await?;
    let lines = events.map(|event| event.to_ndjson_line());

    let mut response = Response::new(Body::from_stream(lines));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(run_id.as_str()) {
        headers.insert("x-run-id", value);
    }
    Ok(response)
}

#[derive(Default, Deserialize)]
struct PingBody {
    #[serde(default)]
    source: Option<String>,
}

// POST /api/ping, body { source? }
pub async fn ping(body: Bytes) -> Json<serde_json::Value> {
    let request: PingBody = lenient_body(&body);
    let source = request.source.unwrap_or_else(|| "unknown".to_string());
    let timestamp = chrono::Utc::now().to_rfc3339();
    info!(source = %source, "Ping received");
    Json(serde_json::json!({
        "ok": true,
        "source": source,
        "timestamp": timestamp,
    }))
}
