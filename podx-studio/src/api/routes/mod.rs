//! API route definitions.

pub mod health;
pub mod logging;
pub mod presets;
pub mod runs;
pub mod validate;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/api/runs", runs::router())
        .nest("/api/presets", presets::router())
        .nest("/api/validate-url", validate::router())
        .nest("/api/logging", logging::router())
        .with_state(state)
}
