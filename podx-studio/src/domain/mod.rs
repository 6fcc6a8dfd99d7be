//! Domain layer for podx-studio.
//!
//! Runs, their stages and configuration, presets, and source URLs.

pub mod options;
pub mod preset;
pub mod run;
pub mod run_config;
pub mod source;
pub mod stage;

pub use options::{
    AdvancedOptions, AsrProvider, ComputeType, ExportFormat, FlagTemplate, OPTION_TABLE,
    OptionDefault, OptionKey, OptionSpec, REDACTED, Secret, Secrets, StageOptions,
};
pub use preset::{Preset, RECOMMENDED_PRESET};
pub use run::{Run, RunId, RunStatus, StageRecord, StageSnapshot};
pub use run_config::RunConfig;
pub use source::{SourceKind, SourceUrl};
pub use stage::{OptionalStage, RequiredStage, StageClass, StageKind, StageOutcome};
