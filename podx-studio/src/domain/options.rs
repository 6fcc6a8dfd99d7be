//! Advanced run options and the static option table.
//!
//! The table is the single source of truth for every advanced toggle: its
//! command-line flag, its default value, and whether it carries a secret.
//! Both option resolution ([`AdvancedOptions::resolve`]) and the debug CLI
//! builder consult it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Marker printed in place of any secret value.
pub const REDACTED: &str = "***REDACTED***";

/// Speech recognition backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AsrProvider {
    #[default]
    Auto,
    Local,
    OpenAi,
    Hf,
}

impl AsrProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsrProvider::Auto => "auto",
            AsrProvider::Local => "local",
            AsrProvider::OpenAi => "openai",
            AsrProvider::Hf => "hf",
        }
    }
}

impl FromStr for AsrProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AsrProvider::Auto),
            "local" => Ok(AsrProvider::Local),
            "openai" => Ok(AsrProvider::OpenAi),
            "hf" => Ok(AsrProvider::Hf),
            other => Err(Error::validation(format!("Unknown ASR provider: {}", other))),
        }
    }
}

/// Numeric precision used by the transcription model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    #[default]
    Int8,
    Float16,
    Float32,
}

impl ComputeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::Int8 => "int8",
            ComputeType::Float16 => "float16",
            ComputeType::Float32 => "float32",
        }
    }
}

impl FromStr for ComputeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int8" => Ok(ComputeType::Int8),
            "float16" => Ok(ComputeType::Float16),
            "float32" => Ok(ComputeType::Float32),
            other => Err(Error::validation(format!("Unknown compute type: {}", other))),
        }
    }
}

/// Transcript export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Txt,
    Srt,
    Vtt,
    Json,
    Md,
    Pdf,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Srt => "srt",
            ExportFormat::Vtt => "vtt",
            ExportFormat::Json => "json",
            ExportFormat::Md => "md",
            ExportFormat::Pdf => "pdf",
        }
    }

    /// Parse a comma separated list, deduplicated and in canonical order.
    pub fn parse_list(s: &str) -> Result<Vec<ExportFormat>> {
        let mut formats = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<ExportFormat>>>()?;
        formats.sort();
        formats.dedup();
        Ok(formats)
    }

    pub fn join(formats: &[ExportFormat]) -> String {
        formats
            .iter()
            .map(ExportFormat::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "txt" => Ok(ExportFormat::Txt),
            "srt" => Ok(ExportFormat::Srt),
            "vtt" => Ok(ExportFormat::Vtt),
            "json" => Ok(ExportFormat::Json),
            "md" | "markdown" => Ok(ExportFormat::Md),
            "pdf" => Ok(ExportFormat::Pdf),
            other => Err(Error::validation(format!("Unknown export format: {}", other))),
        }
    }
}

/// A secret value (API token, database id).
///
/// Never serialized and never printed; read it with [`Secret::expose`] only
/// at the point where it is handed to a stage process.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", REDACTED)
    }
}

/// Secret inputs of a run, injected from the engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    /// Notion database id used by the export stage.
    pub notion_db: Option<Secret>,
    /// API key for the analysis model.
    pub analysis_api_key: Option<Secret>,
}

impl Secrets {
    pub fn get(&self, key: OptionKey) -> Option<&Secret> {
        match key {
            OptionKey::NotionDb => self.notion_db.as_ref(),
            OptionKey::AnalysisApiKey => self.analysis_api_key.as_ref(),
            _ => None,
        }
    }

    /// The secrets a run with `options` needs: the Notion database only
    /// goes along when Notion upload is on.
    pub fn scoped_to(&self, options: &StageOptions) -> Secrets {
        Secrets {
            notion_db: self.notion_db.clone().filter(|_| options.notion),
            analysis_api_key: self.analysis_api_key.clone(),
        }
    }

    /// All secret values currently held, for output scrubbing.
    pub fn values(&self) -> Vec<&str> {
        [&self.notion_db, &self.analysis_api_key]
            .into_iter()
            .flatten()
            .map(Secret::expose)
            .filter(|v| !v.is_empty())
            .collect()
    }
}

/// Every advanced toggle known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    Diarize,
    Align,
    Preprocess,
    Restore,
    AsrProvider,
    Model,
    Compute,
    Analyze,
    AnalysisModel,
    AnalysisTemperature,
    AnalysisType,
    ExportFormats,
    Notion,
    NotionDb,
    AnalysisApiKey,
}

/// How an option is written on the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlagTemplate {
    /// Boolean toggle: one flag for each state.
    Switch {
        on: &'static str,
        off: &'static str,
    },
    /// Flag followed by a value.
    Value(&'static str),
}

/// Default value of an option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionDefault {
    Bool(bool),
    Text(&'static str),
    Float(f32),
    /// Unset unless explicitly provided.
    Absent,
}

/// One row of the option table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionSpec {
    pub key: OptionKey,
    pub flag: FlagTemplate,
    pub default: OptionDefault,
    pub secret: bool,
}

const fn switch(key: OptionKey, on: &'static str, off: &'static str, default: bool) -> OptionSpec {
    OptionSpec {
        key,
        flag: FlagTemplate::Switch { on, off },
        default: OptionDefault::Bool(default),
        secret: false,
    }
}

const fn value(key: OptionKey, flag: &'static str, default: OptionDefault) -> OptionSpec {
    OptionSpec {
        key,
        flag: FlagTemplate::Value(flag),
        default,
        secret: false,
    }
}

const fn secret(key: OptionKey, flag: &'static str) -> OptionSpec {
    OptionSpec {
        key,
        flag: FlagTemplate::Value(flag),
        default: OptionDefault::Absent,
        secret: true,
    }
}

/// The option table, in command-line order.
pub static OPTION_TABLE: [OptionSpec; 15] = [
    value(
        OptionKey::AsrProvider,
        "--asr-provider",
        OptionDefault::Text("auto"),
    ),
    value(
        OptionKey::Model,
        "--model",
        OptionDefault::Text("large-v3-turbo"),
    ),
    value(OptionKey::Compute, "--compute", OptionDefault::Text("int8")),
    switch(OptionKey::Preprocess, "--preprocess", "--no-preprocess", true),
    switch(OptionKey::Restore, "--restore", "--no-restore", false),
    switch(OptionKey::Diarize, "--diarize", "--no-diarize", true),
    switch(OptionKey::Align, "--align", "--no-align", true),
    switch(OptionKey::Analyze, "--deepcast", "--no-deepcast", true),
    value(
        OptionKey::AnalysisModel,
        "--deepcast-model",
        OptionDefault::Text("gpt-4.1"),
    ),
    value(
        OptionKey::AnalysisTemperature,
        "--deepcast-temp",
        OptionDefault::Float(0.2),
    ),
    value(OptionKey::AnalysisType, "--type", OptionDefault::Absent),
    value(
        OptionKey::ExportFormats,
        "--export",
        OptionDefault::Text("txt,srt,md"),
    ),
    switch(OptionKey::Notion, "--notion", "--no-notion", false),
    secret(OptionKey::NotionDb, "--db"),
    secret(OptionKey::AnalysisApiKey, "--openai-api-key"),
];

impl OptionSpec {
    /// Look up the table row for `key`.
    pub fn of(key: OptionKey) -> &'static OptionSpec {
        OPTION_TABLE
            .iter()
            .find(|spec| spec.key == key)
            .unwrap_or_else(|| unreachable!("option table covers every key"))
    }
}

fn default_bool(key: OptionKey) -> bool {
    match OptionSpec::of(key).default {
        OptionDefault::Bool(b) => b,
        _ => false,
    }
}

fn default_text(key: OptionKey) -> &'static str {
    match OptionSpec::of(key).default {
        OptionDefault::Text(t) => t,
        _ => "",
    }
}

fn default_float(key: OptionKey) -> f32 {
    match OptionSpec::of(key).default {
        OptionDefault::Float(f) => f,
        _ => 0.0,
    }
}

/// Fully resolved advanced options of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOptions {
    pub diarize: bool,
    pub align: bool,
    pub preprocess: bool,
    pub restore: bool,
    pub asr_provider: AsrProvider,
    pub model: String,
    pub compute: ComputeType,
    pub analyze: bool,
    pub analysis_model: String,
    pub analysis_temperature: f32,
    pub analysis_type: Option<String>,
    pub export_formats: Vec<ExportFormat>,
    pub notion: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            diarize: default_bool(OptionKey::Diarize),
            align: default_bool(OptionKey::Align),
            preprocess: default_bool(OptionKey::Preprocess),
            restore: default_bool(OptionKey::Restore),
            asr_provider: default_text(OptionKey::AsrProvider)
                .parse()
                .unwrap_or_default(),
            model: default_text(OptionKey::Model).to_string(),
            compute: default_text(OptionKey::Compute).parse().unwrap_or_default(),
            analyze: default_bool(OptionKey::Analyze),
            analysis_model: default_text(OptionKey::AnalysisModel).to_string(),
            analysis_temperature: default_float(OptionKey::AnalysisTemperature),
            analysis_type: None,
            export_formats: ExportFormat::parse_list(default_text(OptionKey::ExportFormats))
                .unwrap_or_default(),
            notion: default_bool(OptionKey::Notion),
        }
    }
}

impl StageOptions {
    /// Every field as an explicit partial option set (used to save presets).
    pub fn to_partial(&self) -> AdvancedOptions {
        AdvancedOptions {
            diarize: Some(self.diarize),
            align: Some(self.align),
            preprocess: Some(self.preprocess),
            restore: Some(self.restore),
            asr_provider: Some(self.asr_provider),
            model: Some(self.model.clone()),
            compute: Some(self.compute),
            analyze: Some(self.analyze),
            analysis_model: Some(self.analysis_model.clone()),
            analysis_temperature: Some(self.analysis_temperature),
            analysis_type: self.analysis_type.clone(),
            export_formats: Some(self.export_formats.clone()),
            notion: Some(self.notion),
        }
    }
}

/// A partial option set, as found in requests and presets.
///
/// `None` means "not specified here"; later layers or defaults fill it in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diarize: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub align: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprocess: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr_provider: Option<AsrProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeType>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "deepcast")]
    pub analyze: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "deepcast_model")]
    pub analysis_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "deepcast_temp")]
    pub analysis_temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_formats: Option<Vec<ExportFormat>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notion: Option<bool>,
}

macro_rules! overlay {
    ($base:ident, $top:ident, $($field:ident),+ $(,)?) => {
        AdvancedOptions {
            $($field: $top.$field.or($base.$field),)+
        }
    };
}

impl AdvancedOptions {
    /// Layer `overrides` on top of `self`; fields set in `overrides` win.
    pub fn merge(self, overrides: AdvancedOptions) -> AdvancedOptions {
        let base = self;
        let top = overrides;
        overlay!(
            base,
            top,
            diarize,
            align,
            preprocess,
            restore,
            asr_provider,
            model,
            compute,
            analyze,
            analysis_model,
            analysis_temperature,
            analysis_type,
            export_formats,
            notion,
        )
    }

    /// Fill unspecified fields from the option table and validate the result.
    pub fn resolve(self) -> Result<StageOptions> {
        let defaults = StageOptions::default();

        let model = self.model.unwrap_or(defaults.model);
        if model.trim().is_empty() {
            return Err(Error::validation("Transcription model cannot be empty"));
        }

        let analysis_model = self.analysis_model.unwrap_or(defaults.analysis_model);
        if analysis_model.trim().is_empty() {
            return Err(Error::validation("Analysis model cannot be empty"));
        }

        let analysis_temperature = self
            .analysis_temperature
            .unwrap_or(defaults.analysis_temperature);
        if !(0.0..=2.0).contains(&analysis_temperature) {
            return Err(Error::validation(format!(
                "Analysis temperature must be between 0 and 2, got {}",
                analysis_temperature
            )));
        }

        let mut export_formats = self.export_formats.unwrap_or(defaults.export_formats);
        export_formats.sort();
        export_formats.dedup();

        Ok(StageOptions {
            diarize: self.diarize.unwrap_or(defaults.diarize),
            align: self.align.unwrap_or(defaults.align),
            preprocess: self.preprocess.unwrap_or(defaults.preprocess),
            restore: self.restore.unwrap_or(defaults.restore),
            asr_provider: self.asr_provider.unwrap_or(defaults.asr_provider),
            model,
            compute: self.compute.unwrap_or(defaults.compute),
            analyze: self.analyze.unwrap_or(defaults.analyze),
            analysis_model,
            analysis_temperature,
            analysis_type: self
                .analysis_type
                .filter(|t| !t.trim().is_empty())
                .or(defaults.analysis_type),
            export_formats,
            notion: self.notion.unwrap_or(defaults.notion),
        })
    }
}
