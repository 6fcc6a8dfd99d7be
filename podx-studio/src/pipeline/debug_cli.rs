//! Reproducible command line for a run.
//!
//! The output is a `podx run ...` invocation equivalent to the run's
//! configuration, for rerunning a pipeline by hand. Only options that differ
//! from their defaults are printed, and secrets are replaced by
//! [`REDACTED`].

use crate::domain::{
    ExportFormat, FlagTemplate, OPTION_TABLE, OptionDefault, OptionKey, REDACTED, RunConfig,
    SourceKind, StageKind,
};

/// Value of one option as seen by the builder.
#[derive(Debug, Clone, PartialEq)]
pub enum CliValue {
    Bool(bool),
    Text(String),
    Float(f32),
    Absent,
    /// A secret is configured; its value is not carried.
    Redacted,
}

/// Input of [`build`]. Holds no secret values.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    source_kind: SourceKind,
    source_url: String,
    values: Vec<(OptionKey, CliValue)>,
}

impl CliArgs {
    pub fn from_config(config: &RunConfig) -> Self {
        let options = &config.options;
        let values = OPTION_TABLE
            .iter()
            .map(|spec| {
                let value = match spec.key {
                    OptionKey::Diarize => CliValue::Bool(options.diarize),
                    OptionKey::Align => CliValue::Bool(options.align),
                    OptionKey::Preprocess => CliValue::Bool(options.preprocess),
                    OptionKey::Restore => CliValue::Bool(options.restore),
                    OptionKey::AsrProvider => CliValue::Text(options.asr_provider.as_str().into()),
                    OptionKey::Model => CliValue::Text(options.model.clone()),
                    OptionKey::Compute => CliValue::Text(options.compute.as_str().into()),
                    OptionKey::Analyze => CliValue::Bool(options.analyze),
                    OptionKey::AnalysisModel => CliValue::Text(options.analysis_model.clone()),
                    OptionKey::AnalysisTemperature => {
                        CliValue::Float(options.analysis_temperature)
                    }
                    OptionKey::AnalysisType => options
                        .analysis_type
                        .clone()
                        .map_or(CliValue::Absent, CliValue::Text),
                    OptionKey::ExportFormats => {
                        CliValue::Text(ExportFormat::join(&options.export_formats))
                    }
                    OptionKey::Notion => CliValue::Bool(options.notion),
                    OptionKey::NotionDb | OptionKey::AnalysisApiKey => {
                        match config.secrets.get(spec.key) {
                            Some(_) => CliValue::Redacted,
                            None => CliValue::Absent,
                        }
                    }
                };
                (spec.key, value)
            })
            .collect();

        Self {
            source_kind: config.source.kind(),
            source_url: config.source.as_str().to_string(),
            values,
        }
    }

    fn value(&self, key: OptionKey) -> &CliValue {
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .unwrap_or(&CliValue::Absent)
    }
}

/// Render the command line. Deterministic for equal inputs.
pub fn build(args: &CliArgs, from_stage: Option<StageKind>) -> String {
    let mut parts = vec!["podx".to_string(), "run".to_string()];

    let source_flag = match args.source_kind {
        SourceKind::Youtube => "--youtube-url",
        SourceKind::Rss | SourceKind::PodcastPage => "--rss-url",
    };
    parts.push(source_flag.to_string());
    parts.push(shell_quote(&args.source_url));

    for spec in OPTION_TABLE.iter() {
        let value = args.value(spec.key);
        match (spec.flag, value) {
            (_, CliValue::Absent) => {}
            (FlagTemplate::Value(flag), CliValue::Redacted) => {
                parts.push(flag.to_string());
                parts.push(shell_quote(REDACTED));
            }
            (FlagTemplate::Switch { on, off }, CliValue::Bool(b)) => {
                if spec.default != OptionDefault::Bool(*b) {
                    parts.push(if *b { on } else { off }.to_string());
                }
            }
            (FlagTemplate::Value(flag), CliValue::Text(text)) => {
                if !matches!(spec.default, OptionDefault::Text(d) if d == text) {
                    parts.push(flag.to_string());
                    parts.push(shell_quote(text));
                }
            }
            (FlagTemplate::Value(flag), CliValue::Float(f)) => {
                let is_default =
                    matches!(spec.default, OptionDefault::Float(d) if (d - f).abs() < 1e-6);
                if !is_default {
                    parts.push(flag.to_string());
                    parts.push(f.to_string());
                }
            }
            _ => {}
        }
    }

    if let Some(stage) = from_stage {
        parts.push("--from-stage".to_string());
        parts.push(stage.as_str().to_string());
    }

    parts.join(" ")
}

/// Quote `s` for a POSIX shell when it contains anything beyond a safe set.
fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '/' | ':' | ',' | '=' | '@' | '%' | '+')
        });
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComputeType, Secret, Secrets, SourceUrl, StageOptions};

    fn config(url: &str, options: StageOptions) -> RunConfig {
        RunConfig::new(SourceUrl::parse(url).unwrap(), options)
    }

    #[test]
    fn test_defaults_are_omitted() {
        let cfg = config("https://a.example/feed.xml", StageOptions::default());
        assert_eq!(
            build(&CliArgs::from_config(&cfg), None),
            "podx run --rss-url https://a.example/feed.xml"
        );
    }

    #[test]
    fn test_youtube_source_and_changed_options() {
        let options = StageOptions {
            diarize: false,
            restore: true,
            compute: ComputeType::Float16,
            analysis_temperature: 0.7,
            analysis_type: Some("interview".to_string()),
            export_formats: vec![ExportFormat::Json],
            ..Default::default()
        };
        let cfg = config("https://youtu.be/abc123", options);

        let cli = build(&CliArgs::from_config(&cfg), Some(StageKind::Transcribe));
        assert_eq!(
            cli,
            "podx run --youtube-url https://youtu.be/abc123 --compute float16 --restore \
             --no-diarize --deepcast-temp 0.7 --type interview --export json \
             --from-stage transcribe"
        );
    }

    #[test]
    fn test_secrets_never_appear() {
        let options = StageOptions {
            notion: true,
            ..Default::default()
        };
        let cfg = config("https://a.example/rss", options).with_secrets(Secrets {
            notion_db: Some(Secret::new("0123456789abcdef0123456789abcdef")),
            analysis_api_key: Some(Secret::new("sk-proj-verysecretvalue")),
        });

        let args = CliArgs::from_config(&cfg);
        assert!(!format!("{:?}", args).contains("verysecret"));

        let cli = build(&args, None);
        assert!(!cli.contains("0123456789abcdef"));
        assert!(!cli.contains("sk-proj-verysecretvalue"));
        assert!(cli.contains("--db '***REDACTED***'"));
        assert!(cli.contains("--openai-api-key '***REDACTED***'"));
    }

    #[test]
    fn test_url_is_quoted_when_needed() {
        let cfg = config(
            "https://www.youtube.com/watch?v=abc&t=10",
            StageOptions::default(),
        );
        assert_eq!(
            build(&CliArgs::from_config(&cfg), None),
            "podx run --youtube-url 'https://www.youtube.com/watch?v=abc&t=10'"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_build_is_deterministic() {
        let cfg = config("https://a.example/podcast/show", StageOptions::default());
        let args = CliArgs::from_config(&cfg);
        assert_eq!(build(&args, None), build(&args.clone(), None));
    }
}
