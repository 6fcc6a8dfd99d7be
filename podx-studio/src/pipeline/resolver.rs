//! Turns a submission request into a fully resolved [`RunConfig`].
//!
//! Layering, lowest to highest: option table defaults, the selected preset,
//! the request's own overrides. Secrets never come from a request; they are
//! injected from the engine configuration.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::database::repositories::PresetRepository;
use crate::domain::{AdvancedOptions, Preset, RECOMMENDED_PRESET, RunConfig, Secrets, SourceUrl};
use crate::{Error, Result};

/// A request to start a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: AdvancedOptions,
}

impl RunRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn with_options(mut self, options: AdvancedOptions) -> Self {
        self.options = options;
        self
    }
}

/// Resolves requests against presets and injects secrets.
#[derive(Clone)]
pub struct ConfigResolver {
    presets: Option<Arc<dyn PresetRepository>>,
    secrets: Secrets,
}

impl ConfigResolver {
    pub fn new(secrets: Secrets) -> Self {
        Self {
            presets: None,
            secrets,
        }
    }

    pub fn with_presets(mut self, presets: Arc<dyn PresetRepository>) -> Self {
        self.presets = Some(presets);
        self
    }

    /// Validate the URL, apply the preset and overrides, and attach secrets.
    pub async fn resolve(&self, request: &RunRequest) -> Result<RunConfig> {
        let source = SourceUrl::parse(&request.url)?;

        let (preset_name, base) = match request.preset.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                let preset = self.find_preset(name).await?;
                (Some(preset.name), preset.options)
            }
            _ => (None, AdvancedOptions::default()),
        };

        let options = base.merge(request.options.clone()).resolve()?;
        debug!(url = %source, kind = %source.kind(), preset = ?preset_name, "Resolved run config");

        let secrets = self.secrets.scoped_to(&options);
        let mut config = RunConfig::new(source, options).with_secrets(secrets);
        if let Some(name) = preset_name {
            config = config.with_preset(name);
        }
        Ok(config)
    }

    /// Re-attach secrets to a configuration loaded from storage.
    pub fn reinject(&self, config: RunConfig) -> RunConfig {
        let secrets = self.secrets.scoped_to(&config.options);
        config.with_secrets(secrets)
    }

    async fn find_preset(&self, name: &str) -> Result<Preset> {
        if let Some(presets) = &self.presets
            && let Some(preset) = presets.get_preset(name).await?
        {
            return Ok(preset);
        }
        if name == RECOMMENDED_PRESET {
            return Ok(Preset::recommended());
        }
        Err(Error::not_found("Preset", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxPresetRepository;
    use crate::database::{init_pool_with_size, run_migrations};
    use crate::domain::{ComputeType, Secret, SourceKind};
    use crate::pipeline::CliArgs;

    fn secrets() -> Secrets {
        Secrets {
            notion_db: None,
            analysis_api_key: Some(Secret::new("sk-test-000000000000")),
        }
    }

    #[tokio::test]
    async fn test_defaults_and_secrets() {
        let resolver = ConfigResolver::new(secrets());
        let config = resolver
            .resolve(&RunRequest::new("https://youtu.be/abc"))
            .await
            .unwrap();

        assert_eq!(config.source.kind(), SourceKind::Youtube);
        assert_eq!(config.preset, None);
        assert_eq!(config.options, crate::domain::StageOptions::default());
        assert_eq!(config.secrets, secrets());
    }

    #[tokio::test]
    async fn test_notion_db_follows_notion_toggle() {
        let resolver = ConfigResolver::new(Secrets {
            notion_db: Some(Secret::new("0123456789abcdef0123456789abcdef")),
            ..secrets()
        });

        let off = resolver
            .resolve(&RunRequest::new("https://youtu.be/abc"))
            .await
            .unwrap();
        assert!(off.secrets.notion_db.is_none());
        assert!(off.secrets.analysis_api_key.is_some());
        let cli = crate::pipeline::debug_cli::build(&CliArgs::from_config(&off), None);
        assert!(!cli.contains("--db"), "{cli}");

        let on = resolver
            .resolve(&RunRequest::new("https://youtu.be/abc").with_options(AdvancedOptions {
                notion: Some(true),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(on.secrets.notion_db.is_some());
        assert!(resolver.reinject(on.clone()).secrets.notion_db.is_some());
    }

    #[tokio::test]
    async fn test_request_overrides_preset() {
        let resolver = ConfigResolver::new(Secrets::default());
        let request = RunRequest::new("https://a.example/feed.xml")
            .with_preset(RECOMMENDED_PRESET)
            .with_options(AdvancedOptions {
                diarize: Some(false),
                compute: Some(ComputeType::Float32),
                ..Default::default()
            });

        let config = resolver.resolve(&request).await.unwrap();
        assert_eq!(config.preset.as_deref(), Some(RECOMMENDED_PRESET));
        assert!(!config.options.diarize);
        assert!(config.options.analyze);
        assert_eq!(config.options.compute, ComputeType::Float32);
    }

    #[tokio::test]
    async fn test_stored_preset_and_unknown_preset() {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqlxPresetRepository::new(pool));
        repo.create_preset(
            &Preset::new(
                "Quick",
                AdvancedOptions {
                    model: Some("small".to_string()),
                    ..Default::default()
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();

        let resolver = ConfigResolver::new(Secrets::default()).with_presets(repo);
        let config = resolver
            .resolve(&RunRequest::new("https://a.example/rss").with_preset("Quick"))
            .await
            .unwrap();
        assert_eq!(config.options.model, "small");

        let err = resolver
            .resolve(&RunRequest::new("https://a.example/rss").with_preset("Nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let resolver = ConfigResolver::new(Secrets::default());
        let err = resolver
            .resolve(&RunRequest::new("ftp://a.example/file"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_reinject() {
        let resolver = ConfigResolver::new(secrets());
        let stored = RunConfig::new(
            SourceUrl::parse("https://a.example/rss").unwrap(),
            Default::default(),
        );
        assert_eq!(resolver.reinject(stored).secrets, secrets());
    }
}
