//! The run aggregate.
//!
//! A [`Run`] owns a fixed stage sequence and one [`StageOutcome`] per stage.
//! Every mutation goes through a transition method that enforces the
//! lifecycle rules, so a run read back from anywhere is always consistent:
//!
//! - outcomes only move forward (`Pending -> Running -> final`, or
//!   `Pending -> Skipped | Canceled`);
//! - the first failed stage fails the run and cancels what is left;
//! - a canceled run has no running or pending stage left;
//! - a run succeeds only when every stage succeeded or was skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use super::run_config::RunConfig;
use super::stage::{StageKind, StageOutcome};
use crate::{Error, Result};

/// Unique identifier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::validation(format!("Invalid run id: {}", s)))
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Queued or running: the run holds a concurrency slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Skip reason or failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageRecord {
    fn pending(stage: StageKind) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Pending,
            artifacts: Vec::new(),
            started_at: None,
            finished_at: None,
            message: None,
        }
    }
}

/// Stage and outcome pair, as carried by progress snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: StageKind,
    pub outcome: StageOutcome,
}

/// A single processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub config: RunConfig,
    stages: Vec<StageRecord>,
    status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    pub output_dir: PathBuf,
    #[serde(default)]
    failed_stage: Option<StageKind>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_excerpt: Option<String>,
    /// Run this one was retried or re-run from.
    #[serde(default)]
    pub retry_of: Option<RunId>,
    /// First stage executed by a retry.
    #[serde(default)]
    pub resume_from: Option<StageKind>,
    /// Page created by the Notion upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notion_url: Option<String>,
}

impl Run {
    /// Create a queued run with every stage of its sequence pending.
    pub fn new(config: RunConfig, output_root: &Path) -> Self {
        let id = RunId::new();
        let stages = config
            .stage_sequence()
            .into_iter()
            .map(StageRecord::pending)
            .collect();

        Self {
            id,
            config,
            stages,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output_dir: output_root.join(id.to_string()),
            failed_stage: None,
            error: None,
            error_excerpt: None,
            retry_of: None,
            resume_from: None,
            notion_url: None,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn stage_sequence(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.stage).collect()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Stage that failed the run, only set when the run is failed.
    pub fn failed_stage(&self) -> Option<StageKind> {
        self.failed_stage
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn error_excerpt(&self) -> Option<&str> {
        self.error_excerpt.as_deref()
    }

    pub fn notion_url(&self) -> Option<&str> {
        self.notion_url.as_deref()
    }

    pub fn set_notion_url(&mut self, url: impl Into<String>) {
        self.notion_url = Some(url.into());
    }

    /// Outcome of `stage`, or `None` when the stage is not in the sequence.
    pub fn outcome(&self, stage: StageKind) -> Option<StageOutcome> {
        self.record(stage).map(|r| r.outcome)
    }

    /// Outcome of `stage`; stages outside the sequence report Skipped.
    pub fn effective_outcome(&self, stage: StageKind) -> StageOutcome {
        self.outcome(stage).unwrap_or(StageOutcome::Skipped)
    }

    pub fn snapshot(&self) -> Vec<StageSnapshot> {
        self.stages
            .iter()
            .map(|r| StageSnapshot {
                stage: r.stage,
                outcome: r.outcome,
            })
            .collect()
    }

    /// First stage still waiting to run.
    pub fn next_pending_stage(&self) -> Option<StageKind> {
        self.stages
            .iter()
            .find(|r| r.outcome == StageOutcome::Pending)
            .map(|r| r.stage)
    }

    /// The stage currently executing, if any.
    pub fn running_stage(&self) -> Option<StageKind> {
        self.stages
            .iter()
            .find(|r| r.outcome == StageOutcome::Running)
            .map(|r| r.stage)
    }

    /// Artifacts produced by every stage before `stage`, in stage order.
    pub fn artifacts_before(&self, stage: StageKind) -> Vec<PathBuf> {
        self.stages
            .iter()
            .take_while(|r| r.stage != stage)
            .flat_map(|r| r.artifacts.iter().cloned())
            .collect()
    }

    /// Every artifact of the run, in stage order.
    pub fn artifacts(&self) -> Vec<(StageKind, PathBuf)> {
        self.stages
            .iter()
            .flat_map(|r| r.artifacts.iter().map(move |p| (r.stage, p.clone())))
            .collect()
    }

    fn record(&self, stage: StageKind) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Queued -> Running.
    pub fn begin(&mut self) -> Result<()> {
        if self.status != RunStatus::Queued {
            return Err(Error::invalid_state(format!(
                "Run {} cannot start from status {}",
                self.id, self.status
            )));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Pending -> Running. Every earlier stage must already be satisfied.
    pub fn start_stage(&mut self, stage: StageKind) -> Result<()> {
        self.ensure_running()?;
        if let Some(blocking) = self
            .stages
            .iter()
            .take_while(|r| r.stage != stage)
            .find(|r| !r.outcome.is_satisfied())
        {
            return Err(Error::invalid_state(format!(
                "Stage {} cannot start while {} is {}",
                stage, blocking.stage, blocking.outcome
            )));
        }
        self.transition(stage, StageOutcome::Running)?;
        Ok(())
    }

    /// Running -> Succeeded, recording the stage's artifacts.
    pub fn complete_stage(&mut self, stage: StageKind, artifacts: Vec<PathBuf>) -> Result<()> {
        self.ensure_running()?;
        if self.outcome(stage) != Some(StageOutcome::Running) {
            return Err(Error::invalid_state(format!(
                "Stage {} is not running",
                stage
            )));
        }
        let record = self.transition(stage, StageOutcome::Succeeded)?;
        record.artifacts = artifacts;
        self.settle();
        Ok(())
    }

    /// Pending or Running -> Skipped.
    pub fn skip_stage(&mut self, stage: StageKind, reason: Option<String>) -> Result<()> {
        self.ensure_running()?;
        let record = self.transition(stage, StageOutcome::Skipped)?;
        record.message = reason;
        self.settle();
        Ok(())
    }

    /// Running -> Failed. The run fails and every pending stage is canceled.
    pub fn fail_stage(
        &mut self,
        stage: StageKind,
        message: impl Into<String>,
        excerpt: Option<String>,
    ) -> Result<()> {
        self.ensure_running()?;
        let message = message.into();
        let record = self.transition(stage, StageOutcome::Failed)?;
        record.message = Some(message.clone());

        self.cancel_unfinished_stages();
        self.status = RunStatus::Failed;
        self.failed_stage = Some(stage);
        self.error = Some(message);
        self.error_excerpt = excerpt;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Cancel the run. Returns false when the run was already terminal.
    ///
    /// The running stage and every pending stage become Canceled; artifacts
    /// of completed stages are kept.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.cancel_unfinished_stages();
        self.status = RunStatus::Canceled;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Cancel a run left non-terminal by a previous process.
    pub fn mark_interrupted(&mut self, reason: impl Into<String>) -> bool {
        let canceled = self.cancel();
        if canceled {
            self.error = Some(reason.into());
        }
        canceled
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(Error::invalid_state(format!(
                "Run {} is {}, not running",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn transition(&mut self, stage: StageKind, next: StageOutcome) -> Result<&mut StageRecord> {
        let record = self
            .stages
            .iter_mut()
            .find(|r| r.stage == stage)
            .ok_or_else(|| {
                Error::invalid_state(format!("Stage {} is not part of this run", stage))
            })?;

        if !record.outcome.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "Stage {} cannot move from {} to {}",
                stage, record.outcome, next
            )));
        }

        let now = Utc::now();
        if next == StageOutcome::Running {
            record.started_at = Some(now);
        } else {
            record.finished_at = Some(now);
        }
        record.outcome = next;
        Ok(record)
    }

    fn cancel_unfinished_stages(&mut self) {
        let now = Utc::now();
        for record in self.stages.iter_mut().filter(|r| !r.outcome.is_final()) {
            record.outcome = StageOutcome::Canceled;
            record.finished_at = Some(now);
        }
    }

    fn settle(&mut self) {
        if self.status == RunStatus::Running && self.stages.iter().all(|r| r.outcome.is_satisfied())
        {
            self.status = RunStatus::Succeeded;
            self.completed_at = Some(Utc::now());
        }
    }

    // ------------------------------------------------------------------
    // Derived runs
    // ------------------------------------------------------------------

    /// Check that the run can be retried from `stage`.
    pub fn ensure_retryable_from(&self, stage: StageKind) -> Result<()> {
        if !matches!(self.status, RunStatus::Failed | RunStatus::Canceled) {
            return Err(Error::invalid_state(format!(
                "Only failed or canceled runs can be retried, run {} is {}",
                self.id, self.status
            )));
        }

        if self.record(stage).is_none() {
            return Err(Error::invalid_state(format!(
                "Stage {} is not part of run {}",
                stage, self.id
            )));
        }

        if let Some(blocking) = self
            .stages
            .iter()
            .take_while(|r| r.stage != stage)
            .find(|r| !r.outcome.is_satisfied())
        {
            return Err(Error::invalid_state(format!(
                "Cannot retry from {}: earlier stage {} is {}",
                stage, blocking.stage, blocking.outcome
            )));
        }

        Ok(())
    }

    /// New queued run that resumes from `stage`.
    ///
    /// Outcomes and artifacts of earlier stages are carried over unchanged;
    /// `stage` and every later stage start over as Pending.
    pub fn retry_from(&self, stage: StageKind, output_root: &Path) -> Result<Run> {
        self.ensure_retryable_from(stage)?;

        let mut retry = Run::new(self.config.clone(), output_root);
        let mut reached = false;
        retry.stages = self
            .stages
            .iter()
            .map(|r| {
                reached |= r.stage == stage;
                if reached {
                    StageRecord::pending(r.stage)
                } else {
                    r.clone()
                }
            })
            .collect();
        retry.retry_of = Some(self.id);
        retry.resume_from = Some(stage);
        Ok(retry)
    }

    /// New queued run with the same configuration, starting from scratch.
    pub fn rerun(&self, output_root: &Path) -> Run {
        let mut run = Run::new(self.config.clone(), output_root);
        run.retry_of = Some(self.id);
        run
    }
}
