//! Fully resolved configuration of a single run.

use serde::{Deserialize, Serialize};

use super::options::{Secrets, StageOptions};
use super::source::SourceUrl;
use super::stage::StageKind;

/// Immutable, fully resolved options for one run.
///
/// Secrets are skipped during serialization; a config loaded back from
/// storage carries none until it is resolved again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Source URL and its detected kind.
    pub source: SourceUrl,
    /// Name of the preset the options were derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    /// Concrete value of every advanced toggle.
    pub options: StageOptions,
    #[serde(skip)]
    pub secrets: Secrets,
}

impl RunConfig {
    pub fn new(source: SourceUrl, options: StageOptions) -> Self {
        Self {
            source,
            preset: None,
            options,
            secrets: Secrets::default(),
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn with_secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = secrets;
        self
    }

    /// Stage sequence for this configuration.
    ///
    /// Diarize and Align only appear when diarization is requested; Align is
    /// part of the diarization pass.
    pub fn stage_sequence(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|stage| match stage {
                StageKind::Diarize | StageKind::Align => self.options.diarize,
                _ => true,
            })
            .collect()
    }

    /// Whether `stage` should be invoked, or resolved to Skipped up front.
    pub fn is_stage_enabled(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Diarize => self.options.diarize,
            StageKind::Align => self.options.diarize && self.options.align,
            StageKind::Analyze => self.options.analyze,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::options::Secret;

    fn config(diarize: bool) -> RunConfig {
        let options = StageOptions {
            diarize,
            ..Default::default()
        };
        RunConfig::new(SourceUrl::parse("https://show.example/ep1").unwrap(), options)
    }

    #[test]
    fn test_sequence_without_diarization() {
        assert_eq!(
            config(false).stage_sequence(),
            vec![
                StageKind::Fetch,
                StageKind::Transcode,
                StageKind::Transcribe,
                StageKind::Analyze,
                StageKind::Export,
            ]
        );
    }

    #[test]
    fn test_sequence_with_diarization() {
        assert_eq!(config(true).stage_sequence(), StageKind::ALL.to_vec());
    }

    #[test]
    fn test_disabled_stages() {
        let mut cfg = config(true);
        cfg.options.align = false;
        cfg.options.analyze = false;

        assert!(cfg.is_stage_enabled(StageKind::Diarize));
        assert!(!cfg.is_stage_enabled(StageKind::Align));
        assert!(!cfg.is_stage_enabled(StageKind::Analyze));
        assert!(cfg.is_stage_enabled(StageKind::Export));
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let cfg = config(false).with_secrets(Secrets {
            notion_db: Some(Secret::new("0123456789abcdef0123456789abcdef")),
            analysis_api_key: Some(Secret::new("sk-test-key")),
        });

        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("0123456789abcdef"));
        assert!(!json.contains("sk-test-key"));

        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.secrets, Secrets::default());
        assert_eq!(back.options, cfg.options);
    }
}
