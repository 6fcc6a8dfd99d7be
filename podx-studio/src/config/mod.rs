//! Engine configuration.
//!
//! Every knob has a default and can be overridden through environment
//! variables (a `.env` file is loaded by the binary before this runs).

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::{Secret, Secrets};
use crate::{Error, Result};

/// Default number of runs allowed in Queued or Running at once.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 1;

/// Default maximum source audio length (4 hours).
pub const DEFAULT_MAX_AUDIO_SECS: u64 = 4 * 60 * 60;

/// Default exit code a stage executable uses to report a missing capability.
pub const DEFAULT_UNAVAILABLE_EXIT_CODE: i32 = 69;

/// How stage executables are launched.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCommandConfig {
    /// Program to spawn for every stage.
    pub program: String,
    /// Argument templates. Supported placeholders: `{stage}`, `{run_id}`,
    /// `{output_dir}`, `{input}`, `{url}`.
    pub args: Vec<String>,
    /// Exit code mapped to "capability unavailable" for optional stages.
    pub unavailable_exit_code: i32,
    /// Number of stderr lines kept for failure excerpts.
    pub stderr_tail_lines: usize,
}

impl Default for StageCommandConfig {
    fn default() -> Self {
        Self {
            program: "podx".to_string(),
            args: [
                "{stage}",
                "--run-id",
                "{run_id}",
                "--url",
                "{url}",
                "--output-dir",
                "{output_dir}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            unavailable_exit_code: DEFAULT_UNAVAILABLE_EXIT_CODE,
            stderr_tail_lines: 20,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_runs: usize,
    pub max_audio_secs: u64,
    /// How long a canceled stage may take to acknowledge before it is abandoned.
    pub cancel_grace: Duration,
    /// Interval between persistence checkpoints while a stage executes.
    pub checkpoint_interval: Duration,
    /// Bounded queue size of each progress subscriber.
    pub subscriber_capacity: usize,
    /// Parent directory of every run's output directory.
    pub output_root: PathBuf,
    pub stage_command: StageCommandConfig,
    pub ffprobe_path: String,
    pub notion_db: Option<String>,
    pub analysis_api_key: Option<String>,
    pub database_url: String,
    pub log_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            max_audio_secs: DEFAULT_MAX_AUDIO_SECS,
            cancel_grace: Duration::from_secs(10),
            checkpoint_interval: Duration::from_secs(5),
            subscriber_capacity: 64,
            output_root: PathBuf::from("./podx-runs"),
            stage_command: StageCommandConfig::default(),
            ffprobe_path: "ffprobe".to_string(),
            notion_db: None,
            analysis_api_key: None,
            database_url: "sqlite:podx-studio.db?mode=rwc".to_string(),
            log_dir: "./logs".to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

impl EngineConfig {
    /// Load the configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `PODX_MAX_CONCURRENT_RUNS` (default: 1)
    /// - `PODX_MAX_AUDIO_SECS` (default: 14400)
    /// - `PODX_CANCEL_GRACE_SECS` (default: 10)
    /// - `PODX_CHECKPOINT_SECS` (default: 5)
    /// - `PODX_SUBSCRIBER_CAPACITY` (default: 64)
    /// - `PODX_OUTPUT_ROOT` (default: `./podx-runs`)
    /// - `PODX_STAGE_BIN` (default: `podx`)
    /// - `PODX_STAGE_ARGS`: whitespace separated argument templates
    /// - `PODX_UNAVAILABLE_EXIT_CODE` (default: 69)
    /// - `PODX_FFPROBE_PATH` (default: `ffprobe`)
    /// - `PODX_NOTION_DB`, `OPENAI_API_KEY`: secrets handed to stages
    /// - `DATABASE_URL` (default: `sqlite:podx-studio.db?mode=rwc`)
    /// - `PODX_LOG_DIR` (default: `./logs`)
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(max) = env_parse::<usize>("PODX_MAX_CONCURRENT_RUNS") {
            config.max_concurrent_runs = max;
        }
        if let Some(secs) = env_parse::<u64>("PODX_MAX_AUDIO_SECS") {
            config.max_audio_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("PODX_CANCEL_GRACE_SECS") {
            config.cancel_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PODX_CHECKPOINT_SECS") {
            config.checkpoint_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_parse::<usize>("PODX_SUBSCRIBER_CAPACITY") {
            config.subscriber_capacity = capacity;
        }
        if let Some(root) = env_string("PODX_OUTPUT_ROOT") {
            config.output_root = PathBuf::from(root);
        }
        if let Some(program) = env_string("PODX_STAGE_BIN") {
            config.stage_command.program = program;
        }
        if let Some(args) = env_string("PODX_STAGE_ARGS") {
            config.stage_command.args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(code) = env_parse::<i32>("PODX_UNAVAILABLE_EXIT_CODE") {
            config.stage_command.unavailable_exit_code = code;
        }
        if let Some(path) = env_string("PODX_FFPROBE_PATH") {
            config.ffprobe_path = path;
        }
        config.notion_db = env_string("PODX_NOTION_DB");
        config.analysis_api_key = env_string("OPENAI_API_KEY");
        if let Some(url) = env_string("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = env_string("PODX_LOG_DIR") {
            config.log_dir = dir;
        }

        config
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_runs == 0 {
            return Err(Error::config("max_concurrent_runs must be at least 1"));
        }
        if self.subscriber_capacity == 0 {
            return Err(Error::config("subscriber_capacity must be at least 1"));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(Error::config("checkpoint_interval must be greater than zero"));
        }
        if self.stage_command.program.trim().is_empty() {
            return Err(Error::config("stage program cannot be empty"));
        }
        Ok(())
    }

    /// Secret values to inject into every resolved run configuration.
    pub fn secrets(&self) -> Secrets {
        Secrets {
            notion_db: self.notion_db.clone().map(Secret::new),
            analysis_api_key: self.analysis_api_key.clone().map(Secret::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_runs, 1);
        assert_eq!(config.max_audio_secs, 14_400);
        assert_eq!(config.cancel_grace, Duration::from_secs(10));
        assert_eq!(config.checkpoint_interval, Duration::from_secs(5));
        assert_eq!(config.subscriber_capacity, 64);
        assert_eq!(config.stage_command.unavailable_exit_code, 69);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = EngineConfig {
            max_concurrent_runs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = EngineConfig {
            subscriber_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secrets() {
        let config = EngineConfig {
            analysis_api_key: Some("sk-abc".to_string()),
            ..Default::default()
        };
        let secrets = config.secrets();
        assert_eq!(secrets.notion_db, None);
        assert_eq!(secrets.values(), vec!["sk-abc"]);
    }
}
