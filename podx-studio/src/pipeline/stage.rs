//! Stage executables.
//!
//! Required stages can only succeed or fail; optional stages (diarize, align)
//! may additionally report that their capability is unavailable on this
//! host. The two cases are separate traits so a required stage has no way to
//! produce an "unavailable" result.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::redact::redact;
use crate::config::StageCommandConfig;
use crate::domain::{OptionalStage, RequiredStage, RunConfig, RunId, StageClass, StageKind};

/// Stdout prefix a stage executable uses to declare an output file.
pub const ARTIFACT_PREFIX: &str = "ARTIFACT ";

/// Everything a stage executable gets to see.
#[derive(Debug, Clone)]
pub struct StageInvocation {
    pub run_id: RunId,
    pub stage: StageKind,
    pub config: RunConfig,
    pub output_dir: PathBuf,
    /// Artifacts of every earlier stage, in stage order.
    pub previous_artifacts: Vec<PathBuf>,
}

/// Failure reported by a stage executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub message: String,
    /// Redacted tail of the executable's diagnostic output.
    pub excerpt: Option<String>,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            excerpt: None,
        }
    }

    pub fn with_excerpt(mut self, excerpt: Option<String>) -> Self {
        self.excerpt = excerpt;
        self
    }
}

/// Failure of an optional stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionalStageError {
    /// The capability is missing; the stage is skipped.
    Unavailable(String),
    Failed(StageError),
}

/// Result of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Succeeded(Vec<PathBuf>),
    Failed {
        message: String,
        excerpt: Option<String>,
    },
    Unavailable(String),
}

impl From<StageError> for StageResult {
    fn from(e: StageError) -> Self {
        StageResult::Failed {
            message: e.message,
            excerpt: e.excerpt,
        }
    }
}

/// Executable of a required stage.
///
/// Implementations should return promptly once `cancel` fires.
#[async_trait]
pub trait StageExecutable: Send + Sync {
    async fn run(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>, StageError>;
}

/// Executable of an optional-capability stage.
#[async_trait]
pub trait OptionalStageExecutable: Send + Sync {
    async fn run(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>, OptionalStageError>;
}

/// The executables of every stage kind.
#[derive(Clone, Default)]
pub struct StageSet {
    required: HashMap<RequiredStage, Arc<dyn StageExecutable>>,
    optional: HashMap<OptionalStage, Arc<dyn OptionalStageExecutable>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set where every stage is backed by the same external command.
    pub fn command(config: StageCommandConfig, kill_grace: Duration) -> Self {
        let command = Arc::new(CommandStage::new(config, kill_grace));
        let mut set = Self::new();
        for stage in StageKind::ALL {
            match stage.class() {
                StageClass::Required(required) => {
                    set.required.insert(required, command.clone());
                }
                StageClass::Optional(optional) => {
                    set.optional.insert(optional, command.clone());
                }
            }
        }
        set
    }

    pub fn with_required(
        mut self,
        stage: RequiredStage,
        executable: Arc<dyn StageExecutable>,
    ) -> Self {
        self.required.insert(stage, executable);
        self
    }

    pub fn with_optional(
        mut self,
        stage: OptionalStage,
        executable: Arc<dyn OptionalStageExecutable>,
    ) -> Self {
        self.optional.insert(stage, executable);
        self
    }

    /// Invoke the executable of `invocation.stage`.
    ///
    /// A panic inside the executable is captured as a failure.
    pub async fn invoke(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> StageResult {
        match invocation.stage.class() {
            StageClass::Required(stage) => {
                let Some(executable) = self.required.get(&stage).cloned() else {
                    return StageError::new(format!(
                        "No executable registered for stage {}",
                        invocation.stage
                    ))
                    .into();
                };

                match AssertUnwindSafe(executable.run(invocation, cancel))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(artifacts)) => StageResult::Succeeded(artifacts),
                    Ok(Err(e)) => e.into(),
                    Err(panic) => panicked(invocation.stage, panic),
                }
            }
            StageClass::Optional(stage) => {
                let Some(executable) = self.optional.get(&stage).cloned() else {
                    return StageResult::Unavailable(format!(
                        "No executable registered for stage {}",
                        invocation.stage
                    ));
                };

                match AssertUnwindSafe(executable.run(invocation, cancel))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(artifacts)) => StageResult::Succeeded(artifacts),
                    Ok(Err(OptionalStageError::Unavailable(reason))) => {
                        StageResult::Unavailable(reason)
                    }
                    Ok(Err(OptionalStageError::Failed(e))) => e.into(),
                    Err(panic) => panicked(invocation.stage, panic),
                }
            }
        }
    }
}

fn panicked(stage: StageKind, panic: Box<dyn std::any::Any + Send>) -> StageResult {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!(stage = %stage, detail = %detail, "Stage executable panicked");
    StageError::new(format!("Stage executable panicked: {}", detail)).into()
}

// ----------------------------------------------------------------------
// External command
// ----------------------------------------------------------------------

/// Stage executable backed by an external program.
///
/// The program runs with the run's output directory as working directory and
/// receives the resolved configuration through environment variables:
///
/// | Variable | Content |
/// |---|---|
/// | `PODX_RUN_ID` | run id |
/// | `PODX_STAGE` | stage name |
/// | `PODX_OUTPUT_DIR` | run output directory |
/// | `PODX_SOURCE_URL` | source URL |
/// | `PODX_INPUT` | most recent earlier artifact |
/// | `PODX_ARTIFACTS` | JSON array of every earlier artifact |
/// | `PODX_CONFIG` | resolved configuration as JSON, without secrets |
/// | `PODX_NOTION_DB`, `OPENAI_API_KEY` | secrets, when configured |
///
/// Every stdout line of the form `ARTIFACT <path>` declares an output file;
/// relative paths are resolved against the output directory.
pub struct CommandStage {
    config: StageCommandConfig,
    kill_grace: Duration,
}

/// How a finished child ended.
struct Finished {
    status: ExitStatus,
    artifacts: Vec<PathBuf>,
    stderr_tail: Vec<String>,
}

enum CommandError {
    /// The program could not be found.
    Missing(String),
    Failed(StageError),
}

impl CommandStage {
    pub fn new(config: StageCommandConfig, kill_grace: Duration) -> Self {
        Self { config, kill_grace }
    }

    /// Substitute placeholders in one argument template.
    fn substitute_variables(template: &str, invocation: &StageInvocation) -> String {
        let input = invocation
            .previous_artifacts
            .last()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        template
            .replace("{stage}", invocation.stage.as_str())
            .replace("{run_id}", &invocation.run_id.to_string())
            .replace("{output_dir}", &invocation.output_dir.to_string_lossy())
            .replace("{input}", &input)
            .replace("{url}", invocation.config.source.as_str())
    }

    fn build_command(
        &self,
        invocation: &StageInvocation,
    ) -> Result<tokio::process::Command, StageError> {
        let config_json = serde_json::to_string(&invocation.config)
            .map_err(|e| StageError::new(format!("Failed to encode run config: {}", e)))?;
        let artifacts_json = serde_json::to_string(&invocation.previous_artifacts)
            .map_err(|e| StageError::new(format!("Failed to encode artifacts: {}", e)))?;

        let mut cmd = process_utils::supervised_command(&self.config.program);
        cmd.args(
            self.config
                .args
                .iter()
                .map(|arg| Self::substitute_variables(arg, invocation)),
        )
        .current_dir(&invocation.output_dir)
        .env("PODX_RUN_ID", invocation.run_id.to_string())
        .env("PODX_STAGE", invocation.stage.as_str())
        .env("PODX_OUTPUT_DIR", &invocation.output_dir)
        .env("PODX_SOURCE_URL", invocation.config.source.as_str())
        .env("PODX_ARTIFACTS", artifacts_json)
        .env("PODX_CONFIG", config_json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        if let Some(input) = invocation.previous_artifacts.last() {
            cmd.env("PODX_INPUT", input);
        }

        let secrets = &invocation.config.secrets;
        if let Some(db) = &secrets.notion_db {
            cmd.env("PODX_NOTION_DB", db.expose());
        }
        if let Some(key) = &secrets.analysis_api_key {
            cmd.env("OPENAI_API_KEY", key.expose());
        }

        Ok(cmd)
    }

    async fn execute(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Finished, CommandError> {
        let stage = invocation.stage;

        tokio::fs::create_dir_all(&invocation.output_dir)
            .await
            .map_err(|e| {
                CommandError::Failed(StageError::new(format!(
                    "Failed to create output directory {}: {}",
                    invocation.output_dir.display(),
                    e
                )))
            })?;

        let mut cmd = self.build_command(invocation).map_err(CommandError::Failed)?;

        info!(
            run_id = %invocation.run_id,
            stage = %stage,
            program = %self.config.program,
            "Spawning stage executable"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CommandError::Missing(format!("Program not found: {}", self.config.program))
            } else {
                CommandError::Failed(StageError::new(format!(
                    "Failed to spawn stage executable: {}",
                    e
                )))
            }
        })?;
        let tree = child.id();

        let stdout_handle = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut artifacts = Vec::new();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match line.strip_prefix(ARTIFACT_PREFIX) {
                        Some(path) if !path.trim().is_empty() => {
                            artifacts.push(PathBuf::from(path.trim()))
                        }
                        _ => debug!(stage = %stage, "stdout: {}", line),
                    }
                }
                artifacts
            })
        });

        let tail_len = self.config.stderr_tail_lines;
        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(tail_len);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail_len == 0 {
                        continue;
                    }
                    if tail.len() == tail_len {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail)
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                CommandError::Failed(StageError::new(format!(
                    "Failed to wait for stage executable: {}",
                    e
                )))
            })?,
            _ = cancel.cancelled() => {
                match process_utils::terminate(&mut child, self.kill_grace).await {
                    Ok(termination) if termination.is_reaped() => {
                        debug!(stage = %stage, ?termination, "Stage executable terminated");
                    }
                    Ok(_) => warn!(stage = %stage, "Stage executable did not exit after kill"),
                    Err(e) => warn!(stage = %stage, error = %e, "Failed to kill stage executable"),
                }
                return Err(CommandError::Failed(StageError::new("Canceled")));
            }
        };

        // Nothing the stage started may outlive it.
        if let Some(pid) = tree
            && let Err(e) = process_utils::kill_process_tree(pid)
        {
            warn!(stage = %stage, error = %e, "Failed to sweep stage process group");
        }

        // A grandchild can keep the pipes open after the child exited.
        let reader_grace = Duration::from_secs(5);
        let artifacts = match stdout_handle {
            Some(h) => tokio::time::timeout(reader_grace, h)
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr_tail = match stderr_handle {
            Some(h) => tokio::time::timeout(reader_grace, h)
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Finished {
            status,
            artifacts,
            stderr_tail,
        })
    }

    fn excerpt(&self, invocation: &StageInvocation, tail: &[String]) -> Option<String> {
        if tail.is_empty() {
            return None;
        }
        let secrets = invocation.config.secrets.values();
        Some(redact(&tail.join("\n"), &secrets))
    }

    fn failure(&self, invocation: &StageInvocation, finished: &Finished) -> StageError {
        let message = match finished.status.code() {
            Some(code) => format!("Stage executable exited with code {}", code),
            None => "Stage executable was terminated by a signal".to_string(),
        };
        StageError::new(message).with_excerpt(self.excerpt(invocation, &finished.stderr_tail))
    }

    fn is_unavailable(&self, finished: &Finished) -> bool {
        finished.status.code() == Some(self.config.unavailable_exit_code)
    }

    async fn run_required(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>, StageError> {
        let finished = match self.execute(invocation, cancel).await {
            Ok(finished) => finished,
            Err(CommandError::Missing(reason)) => return Err(StageError::new(reason)),
            Err(CommandError::Failed(e)) => return Err(e),
        };

        if !finished.status.success() {
            return Err(self.failure(invocation, &finished));
        }
        resolve_artifacts(&invocation.output_dir, finished.artifacts)
    }
}

#[async_trait]
impl StageExecutable for CommandStage {
    async fn run(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>, StageError> {
        self.run_required(invocation, cancel).await
    }
}

#[async_trait]
impl OptionalStageExecutable for CommandStage {
    async fn run(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>, OptionalStageError> {
        let finished = match self.execute(invocation, cancel).await {
            Ok(finished) => finished,
            Err(CommandError::Missing(reason)) => {
                return Err(OptionalStageError::Unavailable(reason));
            }
            Err(CommandError::Failed(e)) => return Err(OptionalStageError::Failed(e)),
        };

        if self.is_unavailable(&finished) {
            let reason = finished
                .stderr_tail
                .last()
                .map(|line| redact(line, &invocation.config.secrets.values()))
                .unwrap_or_else(|| format!("{} is not available", invocation.stage));
            return Err(OptionalStageError::Unavailable(reason));
        }

        if !finished.status.success() {
            return Err(OptionalStageError::Failed(self.failure(invocation, &finished)));
        }
        resolve_artifacts(&invocation.output_dir, finished.artifacts)
            .map_err(OptionalStageError::Failed)
    }
}

/// Resolve declared artifacts against `output_dir` and reject any that escape it.
fn resolve_artifacts(
    output_dir: &Path,
    declared: Vec<PathBuf>,
) -> Result<Vec<PathBuf>, StageError> {
    let root = std::path::absolute(output_dir).map_err(|e| {
        StageError::new(format!(
            "Failed to resolve output directory {}: {}",
            output_dir.display(),
            e
        ))
    })?;

    declared
        .into_iter()
        .map(|path| {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                root.join(&path)
            };
            let escapes = absolute
                .components()
                .any(|c| matches!(c, Component::ParentDir));
            if escapes || !absolute.starts_with(&root) {
                return Err(StageError::new(format!(
                    "Artifact {} is outside the run output directory",
                    path.display()
                )));
            }
            Ok(absolute)
        })
        .collect()
}
