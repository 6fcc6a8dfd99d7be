//! Pipeline stage kinds and per-stage outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// One unit of pipeline work, in declared execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Fetch,
    Transcode,
    Transcribe,
    Diarize,
    Align,
    Analyze,
    Export,
}

impl StageKind {
    /// All stage kinds in declared order.
    pub const ALL: [StageKind; 7] = [
        StageKind::Fetch,
        StageKind::Transcode,
        StageKind::Transcribe,
        StageKind::Diarize,
        StageKind::Align,
        StageKind::Analyze,
        StageKind::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Fetch => "fetch",
            StageKind::Transcode => "transcode",
            StageKind::Transcribe => "transcribe",
            StageKind::Diarize => "diarize",
            StageKind::Align => "align",
            StageKind::Analyze => "analyze",
            StageKind::Export => "export",
        }
    }

    /// Split the kind into its capability class.
    pub fn class(&self) -> StageClass {
        match self {
            StageKind::Fetch => StageClass::Required(RequiredStage::Fetch),
            StageKind::Transcode => StageClass::Required(RequiredStage::Transcode),
            StageKind::Transcribe => StageClass::Required(RequiredStage::Transcribe),
            StageKind::Diarize => StageClass::Optional(OptionalStage::Diarize),
            StageKind::Align => StageClass::Optional(OptionalStage::Align),
            StageKind::Analyze => StageClass::Required(RequiredStage::Analyze),
            StageKind::Export => StageClass::Required(RequiredStage::Export),
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self.class(), StageClass::Optional(_))
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::validation(format!("Unknown stage: {}", s)))
    }
}

/// Stages whose executable must succeed for the run to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequiredStage {
    Fetch,
    Transcode,
    Transcribe,
    Analyze,
    Export,
}

/// Stages backed by a capability that may be missing on the host.
///
/// A missing capability downgrades the stage to `Skipped` instead of failing the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionalStage {
    Diarize,
    Align,
}

impl From<RequiredStage> for StageKind {
    fn from(stage: RequiredStage) -> Self {
        match stage {
            RequiredStage::Fetch => StageKind::Fetch,
            RequiredStage::Transcode => StageKind::Transcode,
            RequiredStage::Transcribe => StageKind::Transcribe,
            RequiredStage::Analyze => StageKind::Analyze,
            RequiredStage::Export => StageKind::Export,
        }
    }
}

impl From<OptionalStage> for StageKind {
    fn from(stage: OptionalStage) -> Self {
        match stage {
            OptionalStage::Diarize => StageKind::Diarize,
            OptionalStage::Align => StageKind::Align,
        }
    }
}

/// Capability class of a stage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageClass {
    Required(RequiredStage),
    Optional(OptionalStage),
}

/// Outcome of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    #[default]
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
    Canceled,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Pending => "pending",
            StageOutcome::Running => "running",
            StageOutcome::Succeeded => "succeeded",
            StageOutcome::Skipped => "skipped",
            StageOutcome::Failed => "failed",
            StageOutcome::Canceled => "canceled",
        }
    }

    /// Whether no further transition is possible for this stage.
    pub fn is_final(&self) -> bool {
        !matches!(self, StageOutcome::Pending | StageOutcome::Running)
    }

    /// Whether the outcome lets the run proceed and eventually succeed.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StageOutcome::Succeeded | StageOutcome::Skipped)
    }

    /// Monotonic transition rule: Pending -> Running -> final, or Pending straight
    /// to Skipped/Canceled for stages that never start.
    pub fn can_transition_to(&self, next: StageOutcome) -> bool {
        match (self, next) {
            (StageOutcome::Pending, StageOutcome::Running) => true,
            (StageOutcome::Pending, StageOutcome::Skipped | StageOutcome::Canceled) => true,
            (StageOutcome::Running, next) => next.is_final(),
            _ => false,
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
