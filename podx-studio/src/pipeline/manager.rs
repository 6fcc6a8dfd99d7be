//! Run manager.
//!
//! Entry point for every run operation: submission, progress subscription,
//! cancellation, retry, history and debugging helpers. Active runs live in
//! memory next to their driver task; finished runs are read back from the
//! run repository.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debug_cli::{self, CliArgs};
use super::export::{self, ExportFile};
use super::guardrail::{FfprobeProbe, Guardrail, MediaProbe, SlotRegistry};
use super::progress::{ProgressEmitter, ProgressStream};
use super::resolver::{ConfigResolver, RunRequest};
use super::stage::StageSet;
use super::state_machine::RunStateMachine;
use crate::config::EngineConfig;
use crate::database::repositories::{MAX_RECENT_RUNS, PresetRepository, RunRepository};
use crate::domain::{ExportFormat, Preset, Run, RunId, StageKind};
use crate::{Error, Result};

/// Extra time a canceller waits beyond the stage grace period.
const CANCEL_WAIT_MARGIN: Duration = Duration::from_secs(5);

/// Error recorded on runs found unfinished at startup.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Broad category of an artifact, derived from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Transcript,
    Audio,
    Analysis,
    Export,
    Other,
}

impl ArtifactKind {
    pub fn classify(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if name.contains("transcript") || ext == "json" {
            ArtifactKind::Transcript
        } else if name.contains("audio") || matches!(ext.as_str(), "wav" | "mp3" | "aac" | "m4a")
        {
            ArtifactKind::Audio
        } else if name.contains("deepcast") || name.contains("analysis") {
            ArtifactKind::Analysis
        } else if matches!(ext.as_str(), "txt" | "srt" | "vtt" | "md" | "pdf") {
            ArtifactKind::Export
        } else {
            ArtifactKind::Other
        }
    }
}

/// One file produced by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub stage: StageKind,
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: Option<u64>,
    pub kind: ArtifactKind,
}

/// In-memory view of a run that has a driver task.
#[derive(Clone)]
struct ActiveRun {
    run: Arc<RwLock<Run>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Settings the manager applies to every run.
#[derive(Debug, Clone)]
pub struct RunManagerConfig {
    pub output_root: PathBuf,
    pub cancel_grace: Duration,
    pub checkpoint_interval: Duration,
}

impl From<&EngineConfig> for RunManagerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            output_root: config.output_root.clone(),
            cancel_grace: config.cancel_grace,
            checkpoint_interval: config.checkpoint_interval,
        }
    }
}

/// Coordinates runs from admission to history.
pub struct RunManager {
    config: RunManagerConfig,
    resolver: ConfigResolver,
    guardrail: Guardrail,
    stages: Arc<StageSet>,
    emitter: Arc<ProgressEmitter>,
    runs: Arc<dyn RunRepository>,
    presets: Option<Arc<dyn PresetRepository>>,
    active: Arc<DashMap<RunId, ActiveRun>>,
    shutdown: CancellationToken,
}

impl RunManager {
    pub fn new(
        config: RunManagerConfig,
        resolver: ConfigResolver,
        guardrail: Guardrail,
        stages: StageSet,
        emitter: Arc<ProgressEmitter>,
        runs: Arc<dyn RunRepository>,
    ) -> Self {
        Self {
            config,
            resolver,
            guardrail,
            stages: Arc::new(stages),
            emitter,
            runs,
            presets: None,
            active: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Production wiring: command-backed stages and an ffprobe length probe.
    pub fn from_config(
        config: &EngineConfig,
        runs: Arc<dyn RunRepository>,
        presets: Arc<dyn PresetRepository>,
    ) -> Self {
        let probe: Arc<dyn MediaProbe> = Arc::new(FfprobeProbe::new(config.ffprobe_path.clone()));
        let guardrail = Guardrail::new(
            SlotRegistry::new(config.max_concurrent_runs),
            probe,
            config.max_audio_secs,
        );
        let resolver = ConfigResolver::new(config.secrets()).with_presets(presets.clone());

        Self::new(
            RunManagerConfig::from(config),
            resolver,
            guardrail,
            StageSet::command(config.stage_command.clone(), config.cancel_grace),
            Arc::new(ProgressEmitter::new(config.subscriber_capacity)),
            runs,
        )
        .with_presets(presets)
    }

    pub fn with_presets(mut self, presets: Arc<dyn PresetRepository>) -> Self {
        self.presets = Some(presets);
        self
    }

    pub fn presets(&self) -> Option<&Arc<dyn PresetRepository>> {
        self.presets.as_ref()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether the manager accepts work.
    pub fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Resolve, admit and start a new run.
    ///
    /// Rejections happen before any record exists.
    pub async fn submit(&self, request: &RunRequest) -> Result<RunId> {
        let config = self.resolver.resolve(request).await?;
        let run = Run::new(config, &self.config.output_root);
        self.start(run).await
    }

    /// Stream the progress of a run. Runs without a live channel replay
    /// their stored state and end.
    pub async fn subscribe(&self, run_id: RunId) -> Result<ProgressStream> {
        if let Some(stream) = self.emitter.subscribe(run_id) {
            return Ok(stream);
        }
        let run = self.load(&run_id).await?;
        Ok(ProgressStream::replay(&run))
    }

    /// Cancel a run and wait until its driver has acknowledged.
    ///
    /// Idempotent: canceling a finished run returns it unchanged.
    pub async fn cancel(&self, run_id: RunId) -> Result<Run> {
        let Some(handle) = self.active.get(&run_id).map(|h| h.value().clone()) else {
            return self.load(&run_id).await;
        };

        if !handle.cancel.is_cancelled() {
            info!(run_id = %run_id, "Cancel requested");
            handle.cancel.cancel();
        }

        let mut done = handle.done.clone();
        let wait = self.config.cancel_grace + CANCEL_WAIT_MARGIN;
        if tokio::time::timeout(wait, done.wait_for(|finished| *finished))
            .await
            .is_err()
        {
            warn!(run_id = %run_id, "Run driver did not finish after cancellation");
        }

        let run = handle.run.read().clone();
        Ok(run)
    }

    /// Start a new run that resumes a failed or canceled run at `stage`.
    pub async fn retry_from_stage(&self, run_id: RunId, stage: StageKind) -> Result<RunId> {
        let original = self.get(run_id).await?;
        let mut retry = original.retry_from(stage, &self.config.output_root)?;
        retry.config = self.resolver.reinject(retry.config);

        info!(run_id = %run_id, retry_id = %retry.id, stage = %stage, "Retrying run");
        self.start(retry).await
    }

    /// Start a fresh run with the configuration of an existing one.
    pub async fn rerun(&self, run_id: RunId) -> Result<RunId> {
        let original = self.get(run_id).await?;
        let mut rerun = original.rerun(&self.config.output_root);
        rerun.config = self.resolver.reinject(rerun.config);

        info!(run_id = %run_id, rerun_id = %rerun.id, "Re-running run");
        self.start(rerun).await
    }

    pub async fn get(&self, run_id: RunId) -> Result<Run> {
        if let Some(handle) = self.active.get(&run_id) {
            return Ok(handle.run.read().clone());
        }
        self.load(&run_id).await
    }

    /// Most recent runs, newest first. Never more than [`MAX_RECENT_RUNS`].
    pub async fn recent(&self, limit: usize) -> Result<Vec<Run>> {
        let limit = limit.min(MAX_RECENT_RUNS);

        let mut runs: Vec<Run> = self
            .active
            .iter()
            .map(|entry| entry.value().run.read().clone())
            .collect();
        let live: HashSet<RunId> = runs.iter().map(|r| r.id).collect();

        runs.extend(
            self.runs
                .list_recent(limit)
                .await?
                .into_iter()
                .filter(|r| !live.contains(&r.id)),
        );

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    /// Files reported by the run's stages that still exist.
    pub async fn artifacts(&self, run_id: RunId) -> Result<Vec<ArtifactInfo>> {
        let run = self.get(run_id).await?;

        let mut artifacts = Vec::new();
        for (stage, path) in run.artifacts() {
            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                debug!(run_id = %run_id, path = %path.display(), "Artifact no longer exists");
                continue;
            };
            artifacts.push(ArtifactInfo {
                stage,
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size_bytes: metadata.is_file().then(|| metadata.len()),
                kind: ArtifactKind::classify(&path),
                path,
            });
        }
        Ok(artifacts)
    }

    /// The run's latest artifact in `format`.
    pub async fn export(&self, run_id: RunId, format: ExportFormat) -> Result<ExportFile> {
        let run = self.get(run_id).await?;
        let artifacts = run.artifacts();
        let missing = || Error::not_found("Artifact", format!("{}:{}", run_id, format.as_str()));

        let path = export::find_export(&artifacts, format).ok_or_else(missing)?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
            Err(e) => return Err(e.into()),
        };

        Ok(ExportFile {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("podx-run-{}.{}", run_id, format.as_str())),
            media_type: export::media_type(format),
            bytes,
        })
    }

    /// Every artifact of the run that still exists, zipped.
    pub async fn export_bundle(&self, run_id: RunId) -> Result<ExportFile> {
        let run = self.get(run_id).await?;
        let artifacts = run.artifacts();
        if !artifacts.iter().any(|(_, path)| path.is_file()) {
            return Err(Error::not_found("Artifacts", run_id.to_string()));
        }

        let bytes = tokio::task::spawn_blocking(move || export::build_bundle(&artifacts))
            .await
            .map_err(|e| Error::Other(format!("Bundle task failed: {}", e)))??;

        Ok(ExportFile {
            file_name: format!("podx-run-{}.zip", run_id),
            media_type: "application/zip",
            bytes,
        })
    }

    /// Command line that reproduces the run, optionally from `from_stage`.
    pub async fn debug_cli(&self, run_id: RunId, from_stage: Option<StageKind>) -> Result<String> {
        let run = self.get(run_id).await?;
        if let Some(stage) = from_stage
            && run.outcome(stage).is_none()
        {
            return Err(Error::validation(format!(
                "Stage {} is not part of run {}",
                stage, run_id
            )));
        }
        Ok(debug_cli::build(&CliArgs::from_config(&run.config), from_stage))
    }

    /// Save the resolved options of a run as a new preset.
    pub async fn save_preset_from_run(&self, run_id: RunId, name: &str) -> Result<Preset> {
        let presets = self
            .presets
            .as_ref()
            .ok_or_else(|| Error::config("Preset storage is not configured"))?;
        let run = self.get(run_id).await?;
        let preset = Preset::from_run_config(name, &run.config)?;
        presets.create_preset(&preset).await?;
        info!(run_id = %run_id, preset = %preset.name, "Saved preset from run");
        Ok(preset)
    }

    /// Mark runs left unfinished by a previous process as canceled.
    ///
    /// Returns the number of runs updated.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut run in self.runs.list_unfinished().await? {
            if self.active.contains_key(&run.id) {
                continue;
            }
            if run.mark_interrupted(INTERRUPTED_BY_RESTART) {
                self.runs.save_run(&run).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Marked interrupted runs as canceled");
        }
        Ok(recovered)
    }

    /// Stop accepting runs, cancel every active run and wait for the drivers.
    pub async fn shutdown(&self) {
        info!(active = self.active.len(), "Shutting down run manager");
        self.shutdown.cancel();

        let handles: Vec<ActiveRun> = self.active.iter().map(|e| e.value().clone()).collect();
        let wait = self.config.cancel_grace + CANCEL_WAIT_MARGIN;
        for mut handle in handles {
            let _ = tokio::time::timeout(wait, handle.done.wait_for(|finished| *finished)).await;
        }
    }

    async fn load(&self, run_id: &RunId) -> Result<Run> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::not_found("Run", run_id.to_string()))
    }

    /// Admit `run`, store it and spawn its driver.
    async fn start(&self, run: Run) -> Result<RunId> {
        if !self.is_alive() {
            return Err(Error::invalid_state("Run manager is shutting down"));
        }

        let run_id = run.id;
        let slot = self.guardrail.admit(run_id, &run.config).await?;

        // The slot is released if storing fails.
        self.runs.save_run(&run).await?;
        self.emitter.register(&run);

        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let shared = Arc::new(RwLock::new(run));
        self.active.insert(
            run_id,
            ActiveRun {
                run: shared.clone(),
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let machine = RunStateMachine::new(
            shared,
            self.stages.clone(),
            self.emitter.clone(),
            self.runs.clone(),
            cancel,
        )
        .with_cancel_grace(self.config.cancel_grace)
        .with_checkpoint_interval(self.config.checkpoint_interval)
        .with_slot(slot);

        let active = self.active.clone();
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            let completion = machine.run_to_completion().await;
            if completion.persisted {
                active.remove(&run_id);
                emitter.remove(&run_id);
            } else {
                warn!(run_id = %run_id, "Final run state was not stored, keeping it in memory");
            }
            let _ = done_tx.send(true);
            debug!(run_id = %run_id, status = %completion.run.status(), "Run driver exited");
        });

        info!(run_id = %run_id, "Run admitted");
        Ok(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_kind() {
        let cases = [
            ("/o/transcript-diarized.json", ArtifactKind::Transcript),
            ("/o/audio.wav", ArtifactKind::Audio),
            ("/o/deepcast-brief.md", ArtifactKind::Analysis),
            ("/o/episode.srt", ArtifactKind::Export),
            ("/o/notes.bin", ArtifactKind::Other),
        ];
        for (path, kind) in cases {
            assert_eq!(ArtifactKind::classify(Path::new(path)), kind, "{}", path);
        }
    }
}
