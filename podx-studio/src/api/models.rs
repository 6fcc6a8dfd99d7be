//! API request and response models.
//!
//! Runs, presets and artifacts are serialized from their domain types
//! directly; this module only holds the shapes that exist for the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AdvancedOptions, Run, RunId, RunStatus, SourceKind, StageKind, StageSnapshot,
};

// ============================================================================
// Runs
// ============================================================================

/// Request body of `POST /api/runs`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunRequest {
    pub url: String,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: AdvancedOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
}

/// Request body of `POST /api/runs/{id}/retry`.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryRequest {
    pub stage: StageKind,
}

/// Query of `GET /api/runs`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: usize,
}

fn default_recent_limit() -> usize {
    crate::database::repositories::MAX_RECENT_RUNS
}

impl Default for RecentQuery {
    fn default() -> Self {
        Self {
            limit: default_recent_limit(),
        }
    }
}

/// Query of `GET /api/runs/{id}/debug-cli`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugCliQuery {
    #[serde(default)]
    pub from_stage: Option<StageKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugCliResponse {
    pub command: String,
}

/// One row of the recent-runs list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub url: String,
    pub source_kind: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    pub status: RunStatus,
    pub stages: Vec<StageSnapshot>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notion_url: Option<String>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            url: run.config.source.as_str().to_string(),
            source_kind: run.config.source.kind(),
            preset: run.config.preset.clone(),
            status: run.status(),
            stages: run.snapshot(),
            created_at: run.created_at,
            completed_at: run.completed_at(),
            failed_stage: run.failed_stage(),
            error: run.error().map(str::to_string),
            notion_url: run.notion_url().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListResponse {
    pub runs: Vec<RunSummary>,
}

// ============================================================================
// Presets
// ============================================================================

/// Request body of `POST /api/runs/{id}/preset`.
#[derive(Debug, Clone, Deserialize)]
pub struct SavePresetRequest {
    pub name: String,
}

/// Request body of `POST /api/presets`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePresetRequest {
    pub name: String,
    #[serde(default)]
    pub options: AdvancedOptions,
}

// ============================================================================
// URL validation
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateUrlRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateUrlResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<SourceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfigResponse {
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub active_runs: usize,
}
