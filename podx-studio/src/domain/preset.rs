//! Named, reusable option sets.

use serde::{Deserialize, Serialize};

use super::options::AdvancedOptions;
use super::run_config::RunConfig;
use crate::{Error, Result};

/// Name of the built-in preset that always exists.
pub const RECOMMENDED_PRESET: &str = "Recommended";

/// A named partial option set. Never holds a source URL or secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub options: AdvancedOptions,
}

impl Preset {
    pub fn new(name: impl Into<String>, options: AdvancedOptions) -> Result<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("Preset name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(Error::validation("Preset name is longer than 64 characters"));
        }
        Ok(Self { name, options })
    }

    /// Capture every resolved option of a run as a preset.
    pub fn from_run_config(name: impl Into<String>, config: &RunConfig) -> Result<Self> {
        Self::new(name, config.options.to_partial())
    }

    /// The built-in preset.
    pub fn recommended() -> Self {
        Self {
            name: RECOMMENDED_PRESET.to_string(),
            options: AdvancedOptions {
                diarize: Some(true),
                analyze: Some(true),
                preprocess: Some(true),
                ..Default::default()
            },
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.name == RECOMMENDED_PRESET
    }
}
