//! Run routes.
//!
//! # Endpoints
//!
//! - `POST /api/runs` - Submit a run
//! - `GET /api/runs` - Recent runs, newest first
//! - `GET /api/runs/{id}` - One run with every stage outcome
//! - `POST /api/runs/{id}/cancel` - Cancel a run
//! - `POST /api/runs/{id}/retry` - Resume a failed or canceled run at a stage
//! - `POST /api/runs/{id}/rerun` - Start a fresh run with the same options
//! - `GET /api/runs/{id}/artifacts` - Files produced by the run
//! - `GET /api/runs/{id}/export/{format}` - Download one export (`txt`, `json`,
//!   `srt`, `vtt`, `md`, `pdf`), or `zip` for every artifact
//! - `GET /api/runs/{id}/debug-cli` - Equivalent command line
//! - `POST /api/runs/{id}/preset` - Save the run's options as a preset
//! - `GET /api/runs/{id}/ws` - Progress events over WebSocket (JSON text frames)

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    CreateRunRequest, CreateRunResponse, DebugCliQuery, DebugCliResponse, RecentQuery,
    RetryRequest, RunListResponse, RunSummary, SavePresetRequest,
};
use crate::api::server::AppState;
use crate::domain::{ExportFormat, Preset, Run, RunId};
use crate::pipeline::{ArtifactInfo, ExportFile, ProgressStream, RunManager, RunRequest};

/// Heartbeat ping interval in seconds.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Create the runs router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_run).get(list_runs))
        .route("/{id}", get(get_run))
        .route("/{id}/cancel", post(cancel_run))
        .route("/{id}/retry", post(retry_run))
        .route("/{id}/rerun", post(rerun_run))
        .route("/{id}/artifacts", get(list_artifacts))
        .route("/{id}/export/{format}", get(export_artifact))
        .route("/{id}/debug-cli", get(debug_cli))
        .route("/{id}/preset", post(save_preset))
        .route("/{id}/ws", get(run_progress_ws))
}

fn run_manager(state: &AppState) -> ApiResult<Arc<RunManager>> {
    state
        .run_manager
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Run manager not available"))
}

fn parse_id(id: &str) -> ApiResult<RunId> {
    Ok(id.parse::<RunId>()?)
}

async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    let manager = run_manager(&state)?;

    let mut run_request = RunRequest::new(request.url).with_options(request.options);
    if let Some(preset) = request.preset {
        run_request = run_request.with_preset(preset);
    }

    let run_id = manager.submit(&run_request).await?;
    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Json<RunListResponse>> {
    let manager = run_manager(&state)?;
    let runs = manager.recent(query.limit).await?;
    Ok(Json(RunListResponse {
        runs: runs.iter().map(RunSummary::from).collect(),
    }))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Run>> {
    let manager = run_manager(&state)?;
    Ok(Json(manager.get(parse_id(&id)?).await?))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Run>> {
    let manager = run_manager(&state)?;
    Ok(Json(manager.cancel(parse_id(&id)?).await?))
}

async fn retry_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RetryRequest>,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    let manager = run_manager(&state)?;
    let run_id = manager
        .retry_from_stage(parse_id(&id)?, request.stage)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })))
}

async fn rerun_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    let manager = run_manager(&state)?;
    let run_id = manager.rerun(parse_id(&id)?).await?;
    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })))
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ArtifactInfo>>> {
    let manager = run_manager(&state)?;
    Ok(Json(manager.artifacts(parse_id(&id)?).await?))
}

async fn export_artifact(
    State(state): State<AppState>,
    Path((id, format)): Path<(String, String)>,
) -> ApiResult<(HeaderMap, Vec<u8>)> {
    let manager = run_manager(&state)?;
    let run_id = parse_id(&id)?;

    let file = if format.eq_ignore_ascii_case("zip") {
        manager.export_bundle(run_id).await?
    } else {
        let format: ExportFormat = format.parse()?;
        manager.export(run_id, format).await?
    };
    download(file)
}

fn download(file: ExportFile) -> ApiResult<(HeaderMap, Vec<u8>)> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(file.media_type));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file.file_name))
            .map_err(|e| ApiError::internal(format!("Invalid header value: {e}")))?,
    );
    Ok((headers, file.bytes))
}

async fn debug_cli(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DebugCliQuery>,
) -> ApiResult<Json<DebugCliResponse>> {
    let manager = run_manager(&state)?;
    let command = manager.debug_cli(parse_id(&id)?, query.from_stage).await?;
    Ok(Json(DebugCliResponse { command }))
}

async fn save_preset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SavePresetRequest>,
) -> ApiResult<(StatusCode, Json<Preset>)> {
    let manager = run_manager(&state)?;
    let preset = manager
        .save_preset_from_run(parse_id(&id)?, &request.name)
        .await?;
    Ok((StatusCode::CREATED, Json(preset)))
}

/// WebSocket handler for run progress.
///
/// The client first receives a snapshot of every stage outcome, then one
/// text frame per transition, then the terminal event, after which the
/// server closes the connection. Unknown runs are rejected before the
/// upgrade.
async fn run_progress_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let manager = run_manager(&state)?;
    let stream = manager.subscribe(parse_id(&id)?).await?;
    Ok(ws.on_upgrade(|socket| handle_socket(socket, stream)))
}

/// Handle an established WebSocket connection.
async fn handle_socket(socket: WebSocket, mut events: ProgressStream) {
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat_interval.reset();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Progress client disconnected");
                        return;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        return;
                    }
                    _ => {}
                }
            }

            event = events.next() => {
                let Some(event) = event else {
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!("Failed to encode progress event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    debug!("Failed to send progress event, closing connection");
                    return;
                }
            }

            _ = heartbeat_interval.tick() => {
                if awaiting_pong {
                    debug!("Client failed to respond to Ping, closing connection");
                    return;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_ok() {
                    awaiting_pong = true;
                } else {
                    return;
                }
            }
        }
    }

    // Stream ended with the terminal event.
    let _ = sender.send(Message::Close(None)).await;
}
