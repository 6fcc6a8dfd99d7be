//! Runtime log filter routes.
//!
//! - `GET /api/logging` - Current filter directive
//! - `PUT /api/logging` - Replace the filter directive

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{LoggingConfigResponse, UpdateLogFilterRequest};
use crate::api::server::AppState;
use crate::logging::LoggingConfig;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(current_filter).put(replace_filter))
}

fn logging(state: &AppState) -> ApiResult<Arc<LoggingConfig>> {
    state
        .logging_config
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Log filter is not reloadable"))
}

async fn current_filter(State(state): State<AppState>) -> ApiResult<Json<LoggingConfigResponse>> {
    let filter = logging(&state)?.get_filter();
    Ok(Json(LoggingConfigResponse { filter }))
}

async fn replace_filter(
    State(state): State<AppState>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let logging = logging(&state)?;
    // Rejected directives surface as 422 through the validation mapping.
    logging.set_filter(&request.filter)?;
    Ok(Json(LoggingConfigResponse {
        filter: logging.get_filter(),
    }))
}
