//! Source URL validation route.

use axum::{Json, Router, routing::post};

use crate::api::error::ApiResult;
use crate::api::models::{ValidateUrlRequest, ValidateUrlResponse};
use crate::api::server::AppState;
use crate::domain::SourceUrl;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(validate_url))
}

/// Check a URL without creating a run. Always answers 200; the verdict is in
/// the body.
async fn validate_url(
    Json(request): Json<ValidateUrlRequest>,
) -> ApiResult<Json<ValidateUrlResponse>> {
    let response = match SourceUrl::parse(&request.url) {
        Ok(source) => ValidateUrlResponse {
            valid: true,
            kind: Some(source.kind()),
            error: None,
        },
        Err(crate::Error::Validation(message)) => ValidateUrlResponse {
            valid: false,
            kind: None,
            error: Some(message),
        },
        Err(e) => return Err(e.into()),
    };
    Ok(Json(response))
}
