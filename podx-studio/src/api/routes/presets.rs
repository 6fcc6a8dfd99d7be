//! Preset routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::CreatePresetRequest;
use crate::api::server::AppState;
use crate::database::repositories::PresetRepository;
use crate::domain::Preset;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_presets).post(create_preset))
        .route("/{name}", delete(delete_preset))
}

fn preset_repository(state: &AppState) -> ApiResult<Arc<dyn PresetRepository>> {
    state
        .run_manager
        .as_ref()
        .and_then(|manager| manager.presets().cloned())
        .ok_or_else(|| ApiError::service_unavailable("Preset storage not available"))
}

async fn list_presets(State(state): State<AppState>) -> ApiResult<Json<Vec<Preset>>> {
    let presets = preset_repository(&state)?;
    Ok(Json(presets.list_presets().await?))
}

async fn create_preset(
    State(state): State<AppState>,
    Json(request): Json<CreatePresetRequest>,
) -> ApiResult<(StatusCode, Json<Preset>)> {
    let presets = preset_repository(&state)?;
    let preset = Preset::new(request.name, request.options)?;
    presets.create_preset(&preset).await?;
    Ok((StatusCode::CREATED, Json(preset)))
}

async fn delete_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let presets = preset_repository(&state)?;
    presets.delete_preset(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
