//! Per-run driver.
//!
//! A [`RunStateMachine`] advances one run through its stage sequence. It is
//! the only writer of the run while the run is active and the only publisher
//! of its progress events. Every stage transition is published, then
//! persisted. While a stage executes the run is also checkpointed at a fixed
//! interval.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::export;
use super::guardrail::SlotGuard;
use super::progress::{ProgressEmitter, StageEvent};
use super::stage::{StageInvocation, StageResult, StageSet};
use crate::Result;
use crate::database::repositories::RunRepository;
use crate::domain::{Run, StageKind, StageOutcome};

/// Default time a canceled stage gets to acknowledge cancellation.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Default checkpoint interval while a stage executes.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Skip reason of stages turned off by the run configuration.
pub const DISABLED_BY_CONFIG: &str = "disabled by configuration";

/// Drives one run to a terminal status.
pub struct RunStateMachine {
    run: Arc<RwLock<Run>>,
    stages: Arc<StageSet>,
    emitter: Arc<ProgressEmitter>,
    repository: Arc<dyn RunRepository>,
    cancel: CancellationToken,
    cancel_grace: Duration,
    checkpoint_interval: Duration,
    /// Released when the machine is dropped, after the final persist.
    slot: Option<SlotGuard>,
}

/// Terminal state of a driven run.
#[derive(Debug, Clone)]
pub struct Completion {
    pub run: Run,
    /// Whether the terminal state was stored.
    pub persisted: bool,
}

enum Step {
    Completed(StageResult),
    Canceled,
}

impl RunStateMachine {
    pub fn new(
        run: Arc<RwLock<Run>>,
        stages: Arc<StageSet>,
        emitter: Arc<ProgressEmitter>,
        repository: Arc<dyn RunRepository>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run,
            stages,
            emitter,
            repository,
            cancel,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            slot: None,
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn with_slot(mut self, slot: SlotGuard) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Run every pending stage in order until the run is terminal.
    ///
    /// Returns the terminal run. Failures of the stages themselves never
    /// surface as errors here; they are recorded in the run.
    pub async fn drive(self) -> Run {
        self.run_to_completion().await.run
    }

    /// Like [`drive`](Self::drive), also reporting whether the terminal
    /// state reached storage.
    pub async fn run_to_completion(self) -> Completion {
        let run_id = self.run.read().id;

        if self.cancel.is_cancelled() {
            self.apply_cancel();
        } else if let Err(e) = self.mutate(|run| run.begin()) {
            error!(run_id = %run_id, error = %e, "Failed to start run");
        } else {
            info!(run_id = %run_id, "Run started");
            // Stage transitions do not carry the run status.
            let started = StageEvent::snapshot(&self.run.read());
            self.emitter.publish(started);
            self.persist().await;
            self.execute_stages().await;
        }

        let run = self.run.read().clone();
        if !run.is_terminal() {
            // Only reachable through a bookkeeping error above.
            warn!(run_id = %run_id, status = %run.status(), "Run left the driver unfinished");
        }

        self.emitter.publish(StageEvent::finished(&run));
        info!(
            run_id = %run_id,
            status = %run.status(),
            failed_stage = ?run.failed_stage(),
            "Run finished"
        );
        let persisted = self.persist().await;

        if let Some(slot) = &self.slot {
            debug!(run_id = %slot.run_id(), "Releasing concurrency slot");
        }
        Completion { run, persisted }
    }

    async fn execute_stages(&self) {
        loop {
            if self.cancel.is_cancelled() {
                self.apply_cancel();
                return;
            }

            let (stage, enabled) = {
                let run = self.run.read();
                if run.is_terminal() {
                    return;
                }
                let Some(stage) = run.next_pending_stage() else {
                    return;
                };
                (stage, run.config.is_stage_enabled(stage))
            };

            if !enabled {
                debug!(stage = %stage, "Skipping stage disabled by configuration");
                if let Err(e) =
                    self.mutate(|run| run.skip_stage(stage, Some(DISABLED_BY_CONFIG.to_string())))
                {
                    error!(stage = %stage, error = %e, "Failed to skip stage");
                    return;
                }
                self.persist().await;
                continue;
            }

            if let Err(e) = self.mutate(|run| run.start_stage(stage)) {
                error!(stage = %stage, error = %e, "Failed to start stage");
                return;
            }
            self.persist().await;

            match self.execute_stage(stage).await {
                Step::Completed(result) => {
                    let succeeded = matches!(result, StageResult::Succeeded(_));
                    self.record_result(stage, result);
                    if succeeded && stage == StageKind::Export {
                        self.capture_notion_url().await;
                    }
                }
                Step::Canceled => {}
            }
            self.persist().await;
        }
    }

    /// Invoke one stage, racing it against cancellation and the checkpoint
    /// ticker.
    async fn execute_stage(&self, stage: StageKind) -> Step {
        let invocation = {
            let run = self.run.read();
            StageInvocation {
                run_id: run.id,
                stage,
                config: run.config.clone(),
                output_dir: run.output_dir.clone(),
                previous_artifacts: run.artifacts_before(stage),
            }
        };

        info!(run_id = %invocation.run_id, stage = %stage, "Stage started");

        let invoke = self.stages.invoke(&invocation, self.cancel.clone());
        tokio::pin!(invoke);

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.checkpoint_interval,
            self.checkpoint_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                result = &mut invoke => {
                    if self.cancel.is_cancelled() {
                        // A result that lands after cancellation never counts.
                        self.apply_cancel();
                        return Step::Canceled;
                    }
                    return Step::Completed(result);
                }
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(run_id = %invocation.run_id, stage = %stage, "Checkpoint");
                    self.persist().await;
                }
            }
        }

        self.apply_cancel();
        match tokio::time::timeout(self.cancel_grace, &mut invoke).await {
            Ok(_) => debug!(stage = %stage, "Stage acknowledged cancellation"),
            Err(_) => warn!(
                run_id = %invocation.run_id,
                stage = %stage,
                grace_secs = self.cancel_grace.as_secs_f64(),
                "CancellationTimeout: stage did not stop within the grace period"
            ),
        }
        Step::Canceled
    }

    fn record_result(&self, stage: StageKind, result: StageResult) {
        let applied = match result {
            StageResult::Succeeded(artifacts) => {
                info!(stage = %stage, artifacts = artifacts.len(), "Stage succeeded");
                self.mutate(|run| run.complete_stage(stage, artifacts))
            }
            StageResult::Failed { message, excerpt } => {
                warn!(stage = %stage, error = %message, "Stage failed");
                self.mutate(|run| run.fail_stage(stage, message, excerpt))
            }
            StageResult::Unavailable(reason) if stage.is_optional() => {
                info!(stage = %stage, reason = %reason, "Stage capability unavailable, skipping");
                self.mutate(|run| run.skip_stage(stage, Some(reason)))
            }
            StageResult::Unavailable(reason) => {
                warn!(stage = %stage, reason = %reason, "Required stage unavailable");
                self.mutate(|run| run.fail_stage(stage, reason, None))
            }
        };

        if let Err(e) = applied {
            error!(stage = %stage, error = %e, "Failed to record stage result");
        }
    }

    /// Record the page link left by the Notion upload.
    async fn capture_notion_url(&self) {
        let artifacts: Vec<_> = {
            let run = self.run.read();
            if !run.config.options.notion {
                return;
            }
            run.artifacts()
                .into_iter()
                .filter(|(stage, _)| *stage == StageKind::Export)
                .map(|(_, path)| path)
                .collect()
        };

        if let Some(url) = export::notion_page_url(&artifacts).await {
            info!(url = %url, "Notion page created");
            self.run.write().set_notion_url(url);
        }
    }

    fn apply_cancel(&self) {
        let _ = self.mutate(|run| {
            if run.cancel() {
                info!(run_id = %run.id, "Run canceled");
            }
            Ok(())
        });
    }

    /// Apply `f` to the run and publish a transition for every stage whose
    /// outcome changed.
    fn mutate<T>(&self, f: impl FnOnce(&mut Run) -> Result<T>) -> Result<T> {
        let (result, events) = {
            let mut run = self.run.write();
            let before = run.snapshot();
            let result = f(&mut run);
            let events: Vec<_> = run
                .stages()
                .iter()
                .zip(before)
                .filter(|(after, before)| after.outcome != before.outcome)
                .map(|(record, _)| {
                    let error = (record.outcome == StageOutcome::Failed)
                        .then(|| record.message.clone())
                        .flatten();
                    StageEvent::transition(run.id, record.stage, record.outcome, error)
                })
                .collect();
            (result, events)
        };

        for event in events {
            self.emitter.publish(event);
        }
        result
    }

    /// Store the current state. A storage failure never stops the run.
    async fn persist(&self) -> bool {
        let run = self.run.read().clone();
        match self.repository.save_run(&run).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Failed to persist run");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunConfig, RunStatus, SourceUrl, StageClass, StageOptions};
    use crate::pipeline::progress::StageEventKind;
    use crate::pipeline::stage::{
        OptionalStageError, OptionalStageExecutable, StageError, StageExecutable,
    };
    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};

    #[derive(Default)]
    struct MemoryRepository {
        saved: Mutex<Vec<Run>>,
    }

    impl MemoryRepository {
        fn saves(&self) -> usize {
            self.saved.lock().len()
        }

        fn last(&self) -> Option<Run> {
            self.saved.lock().last().cloned()
        }
    }

    #[async_trait]
    impl RunRepository for MemoryRepository {
        async fn save_run(&self, run: &Run) -> Result<()> {
            self.saved.lock().push(run.clone());
            Ok(())
        }
        async fn get_run(&self, id: &crate::domain::RunId) -> Result<Option<Run>> {
            Ok(self.saved.lock().iter().rev().find(|r| r.id == *id).cloned())
        }
        async fn list_recent(&self, _limit: usize) -> Result<Vec<Run>> {
            Ok(Vec::new())
        }
        async fn list_unfinished(&self) -> Result<Vec<Run>> {
            Ok(Vec::new())
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Unavailable,
        WaitForCancel,
        IgnoreCancel,
        Panic,
        Sleep(Duration),
        NotionReceipt,
    }

    struct Fake {
        behavior: Behavior,
        calls: Arc<Mutex<Vec<StageKind>>>,
    }

    impl Fake {
        async fn act(
            &self,
            inv: &StageInvocation,
            cancel: CancellationToken,
        ) -> std::result::Result<Vec<PathBuf>, OptionalStageError> {
            self.calls.lock().push(inv.stage);
            match self.behavior {
                Behavior::Succeed => Ok(vec![inv.output_dir.join(format!("{}.out", inv.stage))]),
                Behavior::Fail => Err(OptionalStageError::Failed(
                    StageError::new("boom").with_excerpt(Some("last line".into())),
                )),
                Behavior::Unavailable => Err(OptionalStageError::Unavailable("no gpu".into())),
                Behavior::WaitForCancel => {
                    cancel.cancelled().await;
                    Err(OptionalStageError::Failed(StageError::new("Canceled")))
                }
                Behavior::IgnoreCancel => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
                Behavior::Panic => panic!("executable exploded"),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(vec![inv.output_dir.join(format!("{}.out", inv.stage))])
                }
                Behavior::NotionReceipt => {
                    let receipt = inv.output_dir.join("notion.json");
                    std::fs::create_dir_all(&inv.output_dir).unwrap();
                    std::fs::write(&receipt, r#"{"url": "https://www.notion.so/episode-42"}"#)
                        .unwrap();
                    Ok(vec![receipt])
                }
            }
        }
    }

    #[async_trait]
    impl StageExecutable for Fake {
        async fn run(
            &self,
            inv: &StageInvocation,
            cancel: CancellationToken,
        ) -> std::result::Result<Vec<PathBuf>, StageError> {
            self.act(inv, cancel).await.map_err(|e| match e {
                OptionalStageError::Failed(e) => e,
                OptionalStageError::Unavailable(r) => StageError::new(r),
            })
        }
    }

    #[async_trait]
    impl OptionalStageExecutable for Fake {
        async fn run(
            &self,
            inv: &StageInvocation,
            cancel: CancellationToken,
        ) -> std::result::Result<Vec<PathBuf>, OptionalStageError> {
            self.act(inv, cancel).await
        }
    }

    struct Harness {
        calls: Arc<Mutex<Vec<StageKind>>>,
        stages: StageSet,
    }

    impl Harness {
        fn new() -> Self {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let mut harness = Self {
                calls,
                stages: StageSet::new(),
            };
            for stage in StageKind::ALL {
                harness = harness.with(stage, Behavior::Succeed);
            }
            harness
        }

        fn with(mut self, stage: StageKind, behavior: Behavior) -> Self {
            let fake = Arc::new(Fake {
                behavior,
                calls: self.calls.clone(),
            });
            self.stages = match stage.class() {
                StageClass::Required(r) => self.stages.with_required(r, fake),
                StageClass::Optional(o) => self.stages.with_optional(o, fake),
            };
            self
        }

        fn calls(&self) -> Vec<StageKind> {
            self.calls.lock().clone()
        }
    }

    fn run_with(options: StageOptions) -> Run {
        let config = RunConfig::new(SourceUrl::parse("https://a.example/feed.xml").unwrap(), options);
        Run::new(config, Path::new("/tmp/podx-test"))
    }

    fn machine(
        run: Run,
        harness: &Harness,
        emitter: &Arc<ProgressEmitter>,
        repo: &Arc<MemoryRepository>,
        cancel: CancellationToken,
    ) -> RunStateMachine {
        emitter.register(&run);
        RunStateMachine::new(
            Arc::new(RwLock::new(run)),
            Arc::new(harness.stages.clone()),
            emitter.clone(),
            repo.clone(),
            cancel,
        )
        .with_cancel_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let harness = Harness::new();
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions::default());
        let run_id = run.id;
        let machine = machine(run, &harness, &emitter, &repo, CancellationToken::new());
        let mut events = emitter.subscribe(run_id).unwrap();

        let done = machine.drive().await;

        assert_eq!(done.status(), RunStatus::Succeeded);
        assert_eq!(harness.calls(), StageKind::ALL.to_vec());
        assert_eq!(done.artifacts().len(), 7);
        assert_eq!(repo.last().unwrap(), done);

        let mut kinds = Vec::new();
        while let Some(event) = events.next().await {
            kinds.push(event.kind);
        }
        assert!(matches!(kinds.first(), Some(StageEventKind::Snapshot { .. })));
        assert!(matches!(
            kinds.last(),
            Some(StageEventKind::Finished { status: RunStatus::Succeeded, .. })
        ));
        assert!(matches!(
            kinds.get(1),
            Some(StageEventKind::Snapshot { status: RunStatus::Running, .. })
        ));
        // Both snapshots, Running and Succeeded for each of the seven
        // stages, then the terminal event.
        assert_eq!(kinds.len(), 2 + 14 + 1);
    }

    #[tokio::test]
    async fn test_disabled_stages_are_skipped_without_invocation() {
        let harness = Harness::new();
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions {
            diarize: false,
            analyze: false,
            ..Default::default()
        });

        let done = machine(run, &harness, &emitter, &repo, CancellationToken::new())
            .drive()
            .await;

        assert_eq!(done.status(), RunStatus::Succeeded);
        assert_eq!(
            harness.calls(),
            vec![StageKind::Fetch, StageKind::Transcode, StageKind::Transcribe, StageKind::Export]
        );
        assert_eq!(done.effective_outcome(StageKind::Diarize), StageOutcome::Skipped);
        assert_eq!(done.effective_outcome(StageKind::Align), StageOutcome::Skipped);
        assert_eq!(done.outcome(StageKind::Analyze), Some(StageOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_align_disabled_while_diarize_enabled() {
        let harness = Harness::new();
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions {
            align: false,
            ..Default::default()
        });

        let done = machine(run, &harness, &emitter, &repo, CancellationToken::new())
            .drive()
            .await;

        assert_eq!(done.outcome(StageKind::Diarize), Some(StageOutcome::Succeeded));
        assert_eq!(done.outcome(StageKind::Align), Some(StageOutcome::Skipped));
        assert!(!harness.calls().contains(&StageKind::Align));
    }

    #[tokio::test]
    async fn test_failure_cancels_the_rest() {
        let harness = Harness::new().with(StageKind::Transcribe, Behavior::Fail);
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions::default());

        let done = machine(run, &harness, &emitter, &repo, CancellationToken::new())
            .drive()
            .await;

        assert_eq!(done.status(), RunStatus::Failed);
        assert_eq!(done.failed_stage(), Some(StageKind::Transcribe));
        assert_eq!(done.error(), Some("boom"));
        assert_eq!(done.error_excerpt(), Some("last line"));
        for stage in [StageKind::Diarize, StageKind::Align, StageKind::Analyze, StageKind::Export] {
            assert_eq!(done.outcome(stage), Some(StageOutcome::Canceled));
        }
        assert_eq!(harness.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_optional_stage_is_skipped() {
        let harness = Harness::new().with(StageKind::Diarize, Behavior::Unavailable);
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions::default());

        let done = machine(run, &harness, &emitter, &repo, CancellationToken::new())
            .drive()
            .await;

        assert_eq!(done.status(), RunStatus::Succeeded);
        assert_eq!(done.outcome(StageKind::Diarize), Some(StageOutcome::Skipped));
        let record = done.stages().iter().find(|r| r.stage == StageKind::Diarize).unwrap();
        assert_eq!(record.message.as_deref(), Some("no gpu"));
    }

    #[tokio::test]
    async fn test_panic_is_a_stage_failure() {
        let harness = Harness::new().with(StageKind::Fetch, Behavior::Panic);
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions::default());

        let done = machine(run, &harness, &emitter, &repo, CancellationToken::new())
            .drive()
            .await;

        assert_eq!(done.status(), RunStatus::Failed);
        assert_eq!(done.failed_stage(), Some(StageKind::Fetch));
        assert!(done.error().unwrap().contains("executable exploded"));
    }

    #[tokio::test]
    async fn test_cancel_mid_stage() {
        let harness = Harness::new().with(StageKind::Transcode, Behavior::WaitForCancel);
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(machine(run, &harness, &emitter, &repo, cancel.clone()).drive());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let done = task.await.unwrap();

        assert_eq!(done.status(), RunStatus::Canceled);
        assert_eq!(done.outcome(StageKind::Fetch), Some(StageOutcome::Succeeded));
        assert_eq!(done.outcome(StageKind::Transcode), Some(StageOutcome::Canceled));
        assert_eq!(done.outcome(StageKind::Export), Some(StageOutcome::Canceled));
        assert_eq!(done.artifacts().len(), 1);
        assert_eq!(harness.calls(), vec![StageKind::Fetch, StageKind::Transcode]);
    }

    #[tokio::test]
    async fn test_notion_url_is_recorded_after_export() {
        let harness = Harness::new().with(StageKind::Export, Behavior::NotionReceipt);
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions {
            notion: true,
            ..Default::default()
        });
        let output_dir = run.output_dir.clone();

        let done = machine(run, &harness, &emitter, &repo, CancellationToken::new())
            .drive()
            .await;
        let _ = std::fs::remove_dir_all(&output_dir);

        assert_eq!(done.status(), RunStatus::Succeeded);
        assert_eq!(done.notion_url(), Some("https://www.notion.so/episode-42"));
        assert_eq!(repo.last().unwrap().notion_url(), done.notion_url());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_running_run() {
        let harness = Harness::new().with(StageKind::Fetch, Behavior::WaitForCancel);
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions::default());
        let run_id = run.id;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(machine(run, &harness, &emitter, &repo, cancel.clone()).drive());
        while harness.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut events = emitter.subscribe(run_id).unwrap();
        match events.next().await.map(|e| e.kind) {
            Some(StageEventKind::Snapshot { status, stages }) => {
                assert_eq!(status, RunStatus::Running);
                assert_eq!(stages[0].stage, StageKind::Fetch);
                assert_eq!(stages[0].outcome, StageOutcome::Running);
            }
            other => panic!("expected a snapshot, got {other:?}"),
        }

        cancel.cancel();
        assert_eq!(task.await.unwrap().status(), RunStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_gives_up_after_grace() {
        let harness = Harness::new().with(StageKind::Fetch, Behavior::IgnoreCancel);
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(machine(run, &harness, &emitter, &repo, cancel.clone()).drive());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = std::time::Instant::now();
        cancel.cancel();
        let done = task.await.unwrap();

        assert_eq!(done.status(), RunStatus::Canceled);
        assert_eq!(done.outcome(StageKind::Fetch), Some(StageOutcome::Canceled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let harness = Harness::new();
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let done = machine(run, &harness, &emitter, &repo, cancel).drive().await;

        assert_eq!(done.status(), RunStatus::Canceled);
        assert!(harness.calls().is_empty());
        assert!(done.stages().iter().all(|r| r.outcome == StageOutcome::Canceled));
    }

    #[tokio::test]
    async fn test_checkpoints_while_stage_runs() {
        let harness =
            Harness::new().with(StageKind::Fetch, Behavior::Sleep(Duration::from_millis(250)));
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let run = run_with(StageOptions {
            diarize: false,
            ..Default::default()
        });

        let done = machine(run, &harness, &emitter, &repo, CancellationToken::new())
            .with_checkpoint_interval(Duration::from_millis(50))
            .drive()
            .await;

        assert_eq!(done.status(), RunStatus::Succeeded);
        // begin + per-stage start/finish (5 stages) + final; checkpoints come on top.
        let baseline = 1 + 5 * 2 + 1;
        assert!(repo.saves() > baseline, "saves = {}", repo.saves());
    }

    #[tokio::test]
    async fn test_resumes_from_first_pending_stage() {
        let harness = Harness::new().with(StageKind::Analyze, Behavior::Fail);
        let emitter = Arc::new(ProgressEmitter::default());
        let repo = Arc::new(MemoryRepository::default());
        let failed = machine(
            run_with(StageOptions::default()),
            &harness,
            &emitter,
            &repo,
            CancellationToken::new(),
        )
        .drive()
        .await;
        assert_eq!(failed.status(), RunStatus::Failed);

        let retry = failed.retry_from(StageKind::Analyze, Path::new("/tmp/podx-test")).unwrap();
        let fixed = Harness::new();
        let done = machine(retry, &fixed, &emitter, &repo, CancellationToken::new())
            .drive()
            .await;

        assert_eq!(done.status(), RunStatus::Succeeded);
        assert_eq!(fixed.calls(), vec![StageKind::Analyze, StageKind::Export]);
        assert_eq!(done.retry_of, Some(failed.id));
    }
}
