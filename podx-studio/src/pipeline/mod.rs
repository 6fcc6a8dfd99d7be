//! Run orchestration.
//!
//! - [`stage`]: stage executables and the command-backed adapter
//! - [`state_machine`]: drives one run through its stages
//! - [`guardrail`]: concurrency slots and media length admission
//! - [`progress`]: per-run event fan-out
//! - [`resolver`]: request + preset + defaults into a run configuration
//! - [`debug_cli`]: reproducible command line of a run
//! - [`export`]: artifact downloads and zip bundles
//! - [`manager`]: the operations exposed to callers

pub mod debug_cli;
pub mod export;
pub mod guardrail;
pub mod manager;
pub mod progress;
pub mod redact;
pub mod resolver;
pub mod stage;
pub mod state_machine;

pub use debug_cli::{CliArgs, CliValue};
pub use export::ExportFile;
pub use guardrail::{FfprobeProbe, Guardrail, MediaProbe, NoopProbe, SlotGuard, SlotRegistry};
pub use manager::{ArtifactInfo, ArtifactKind, INTERRUPTED_BY_RESTART, RunManager, RunManagerConfig};
pub use progress::{ProgressEmitter, ProgressStream, StageEvent, StageEventKind};
pub use resolver::{ConfigResolver, RunRequest};
pub use stage::{
    CommandStage, OptionalStageError, OptionalStageExecutable, StageError, StageExecutable,
    StageInvocation, StageResult, StageSet,
};
pub use state_machine::{Completion, RunStateMachine};
