//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use podx_studio::database::repositories::{
    PresetRepository, SqlxPresetRepository, SqlxRunRepository,
};
use podx_studio::database::{DbPool, init_pool_with_size, run_migrations};
use podx_studio::domain::{Run, RunId, Secret, Secrets, StageClass, StageKind};
use podx_studio::pipeline::{
    ConfigResolver, Guardrail, NoopProbe, OptionalStageError, OptionalStageExecutable,
    ProgressEmitter, RunManager, RunManagerConfig, SlotRegistry, StageError, StageExecutable,
    StageInvocation, StageSet,
};

pub const YOUTUBE_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
pub const FEED_URL: &str = "https://feeds.example.com/show/feed.xml";
pub const API_KEY: &str = "sk-test-0123456789abcdef";

/// What a fake stage does when invoked.
#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Fails on the first invocation, succeeds afterwards.
    FailOnce,
    WaitForCancel,
}

/// Stage executable that writes one artifact per invocation and records
/// every call.
pub struct FakeStage {
    behaviors: Mutex<HashMap<StageKind, Behavior>>,
    failed_once: Mutex<Vec<StageKind>>,
    calls: Mutex<Vec<(RunId, StageKind)>>,
}

impl FakeStage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(HashMap::new()),
            failed_once: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, stage: StageKind, behavior: Behavior) {
        self.behaviors.lock().insert(stage, behavior);
    }

    pub fn calls_for(&self, run_id: RunId) -> Vec<StageKind> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, stage)| *stage)
            .collect()
    }

    async fn act(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>, StageError> {
        self.calls.lock().push((invocation.run_id, invocation.stage));
        let behavior = self
            .behaviors
            .lock()
            .get(&invocation.stage)
            .copied()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => write_artifact(invocation).await,
            Behavior::Fail => Err(StageError::new("stage exploded")
                .with_excerpt(Some("traceback: stage exploded".to_string()))),
            Behavior::FailOnce => {
                let first = {
                    let mut failed = self.failed_once.lock();
                    if failed.contains(&invocation.stage) {
                        false
                    } else {
                        failed.push(invocation.stage);
                        true
                    }
                };
                if first {
                    Err(StageError::new("transient failure"))
                } else {
                    write_artifact(invocation).await
                }
            }
            Behavior::WaitForCancel => {
                cancel.cancelled().await;
                Err(StageError::new("Canceled"))
            }
        }
    }
}

async fn write_artifact(invocation: &StageInvocation) -> Result<Vec<PathBuf>, StageError> {
    tokio::fs::create_dir_all(&invocation.output_dir)
        .await
        .map_err(|e| StageError::new(e.to_string()))?;
    let path = invocation
        .output_dir
        .join(format!("{}.json", invocation.stage));
    tokio::fs::write(&path, b"{}")
        .await
        .map_err(|e| StageError::new(e.to_string()))?;
    Ok(vec![path])
}

#[async_trait]
impl StageExecutable for FakeStage {
    async fn run(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>, StageError> {
        self.act(invocation, cancel).await
    }
}

#[async_trait]
impl OptionalStageExecutable for FakeStage {
    async fn run(
        &self,
        invocation: &StageInvocation,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>, OptionalStageError> {
        self.act(invocation, cancel)
            .await
            .map_err(OptionalStageError::Failed)
    }
}

/// A manager wired to fake stages, an in-memory database and a temporary
/// output root.
pub struct TestEngine {
    pub manager: Arc<RunManager>,
    pub stages: Arc<FakeStage>,
    pub pool: DbPool,
    pub runs: Arc<SqlxRunRepository>,
    pub presets: Arc<SqlxPresetRepository>,
    pub output: TempDir,
}

pub async fn setup_test_db() -> DbPool {
    let pool = init_pool_with_size("sqlite::memory:", 1)
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

pub async fn engine(max_concurrent_runs: usize) -> TestEngine {
    let pool = setup_test_db().await;
    let runs = Arc::new(SqlxRunRepository::new(pool.clone()));
    let presets = Arc::new(SqlxPresetRepository::new(pool.clone()));
    presets.ensure_builtin().await.expect("builtin preset");

    let output = TempDir::new().expect("temp dir");
    let fake = FakeStage::new();

    let mut stage_set = StageSet::new();
    for stage in StageKind::ALL {
        stage_set = match stage.class() {
            StageClass::Required(required) => stage_set.with_required(required, fake.clone()),
            StageClass::Optional(optional) => stage_set.with_optional(optional, fake.clone()),
        };
    }

    let secrets = Secrets {
        notion_db: None,
        analysis_api_key: Some(Secret::new(API_KEY)),
    };
    let resolver = ConfigResolver::new(secrets).with_presets(presets.clone());
    let guardrail = Guardrail::new(
        SlotRegistry::new(max_concurrent_runs),
        Arc::new(NoopProbe),
        14_400,
    );
    let config = RunManagerConfig {
        output_root: output.path().to_path_buf(),
        cancel_grace: Duration::from_secs(2),
        checkpoint_interval: Duration::from_millis(50),
    };

    let manager = RunManager::new(
        config,
        resolver,
        guardrail,
        stage_set,
        Arc::new(ProgressEmitter::default()),
        runs.clone(),
    )
    .with_presets(presets.clone());

    TestEngine {
        manager: Arc::new(manager),
        stages: fake,
        pool,
        runs,
        presets,
        output,
    }
}

/// Poll until the run is finished and its driver has let go of it.
pub async fn wait_finished(manager: &RunManager, run_id: RunId) -> Run {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let run = manager.get(run_id).await.expect("run exists");
            if run.is_terminal() && manager.active_count() == 0 {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run did not finish in time")
}

/// Poll until `stage` of the run is executing.
pub async fn wait_running(manager: &RunManager, run_id: RunId, stage: StageKind) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let run = manager.get(run_id).await.expect("run exists");
            if run.running_stage() == Some(stage) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stage did not start in time")
}
