//! HTTP server: listener configuration, shared state and middleware.

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, MakeSpan, OnResponse, TraceLayer};
use tracing::{Level, Span};

use crate::api::routes;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::pipeline::RunManager;

/// Requests under this prefix are not traced.
const HEALTH_PREFIX: &str = "/health";

/// Listener and middleware settings.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Maximum request body size in bytes.
    pub body_limit: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8765,
            enable_cors: true,
            body_limit: 1024 * 1024,
        }
    }
}

impl ApiServerConfig {
    /// Defaults overridden by `API_BIND_ADDRESS` and `API_PORT`.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(address) = std::env::var("API_BIND_ADDRESS")
            && !address.trim().is_empty()
        {
            config.bind_address = address.trim().to_string();
        }
        if let Some(port) = std::env::var("API_PORT")
            .ok()
            .and_then(|p| p.trim().parse::<u16>().ok())
        {
            config.port = port;
        }

        config
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid listen address: {}", e)))
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    /// Run manager
    pub run_manager: Option<Arc<RunManager>>,
    /// Logging configuration for dynamic log level changes
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    /// Create a new application state without services (for testing).
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            run_manager: None,
            logging_config: None,
        }
    }

    pub fn with_run_manager(mut self, run_manager: Arc<RunManager>) -> Self {
        self.run_manager = Some(run_manager);
        self
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self::with_state(config, AppState::new())
    }

    pub fn with_state(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Routes plus body limit, CORS and request tracing.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone())
            .layer(DefaultBodyLimit::max(self.config.body_limit));

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        // Health probes get a disabled span so they stay out of the logs.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(make_span)
                .on_response(on_response),
        )
    }

    /// Serve until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down");
            })
            .await
            .map_err(|e| Error::ApiError(format!("Server error: {}", e)))
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

fn make_span(req: &Request) -> Span {
    if req.uri().path().starts_with(HEALTH_PREFIX) {
        return Span::none();
    }
    DefaultMakeSpan::new().level(Level::INFO).make_span(req)
}

fn on_response(res: &Response<axum::body::Body>, latency: Duration, span: &Span) {
    if !span.is_disabled() {
        DefaultOnResponse::new()
            .level(Level::INFO)
            .on_response(res, latency, span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ApiServerConfig::default();
        assert_eq!(config.socket_addr().unwrap().to_string(), "127.0.0.1:8765");
        assert!(config.enable_cors);

        let bad = ApiServerConfig {
            bind_address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(bad.socket_addr().is_err());
    }

    #[test]
    fn test_server_creation() {
        let server = ApiServer::new(ApiServerConfig::default());
        assert!(!server.cancel_token().is_cancelled());
        server.shutdown();
        assert!(server.cancel_token().is_cancelled());
    }
}
