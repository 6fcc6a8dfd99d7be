//! Row models mapping directly to the database schema.

use sqlx::FromRow;

use super::time::{datetime_to_ms, now_ms};
use crate::Result;
use crate::domain::{AdvancedOptions, Preset, Run};

/// A row of the `runs` table.
#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: String,
    pub status: String,
    pub source_url: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub retry_of: Option<String>,
    /// The full run as JSON.
    pub data: String,
}

impl RunRow {
    pub fn from_run(run: &Run) -> Result<Self> {
        Ok(Self {
            id: run.id.to_string(),
            status: run.status().as_str().to_string(),
            source_url: run.config.source.as_str().to_string(),
            created_at: datetime_to_ms(run.created_at),
            completed_at: run.completed_at().map(datetime_to_ms),
            retry_of: run.retry_of.map(|id| id.to_string()),
            data: serde_json::to_string(run)?,
        })
    }

    /// Decode the stored document. Secrets are never stored, so the
    /// returned run carries none.
    pub fn into_run(self) -> Result<Run> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// A row of the `presets` table.
#[derive(Debug, Clone, FromRow)]
pub struct PresetRow {
    pub name: String,
    /// Partial options as JSON.
    pub options: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PresetRow {
    pub fn from_preset(preset: &Preset) -> Result<Self> {
        let now = now_ms();
        Ok(Self {
            name: preset.name.clone(),
            options: serde_json::to_string(&preset.options)?,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn into_preset(self) -> Result<Preset> {
        let options: AdvancedOptions = serde_json::from_str(&self.options)?;
        Ok(Preset {
            name: self.name,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunConfig, Secret, Secrets, SourceUrl, StageOptions};
    use std::path::Path;

    #[test]
    fn test_run_row_never_contains_secrets() {
        let config = RunConfig::new(
            SourceUrl::parse("https://youtu.be/abc").unwrap(),
            StageOptions::default(),
        )
        .with_secrets(Secrets {
            notion_db: Some(Secret::new("notion-db-0123456789")),
            analysis_api_key: Some(Secret::new("sk-live-0123456789")),
        });
        let run = Run::new(config, Path::new("/tmp/podx"));

        let row = RunRow::from_run(&run).unwrap();
        assert_eq!(row.status, "queued");
        assert!(!row.data.contains("notion-db-0123456789"));
        assert!(!row.data.contains("sk-live-0123456789"));

        let back = row.into_run().unwrap();
        assert_eq!(back.id, run.id);
        assert_eq!(back.config.secrets, Secrets::default());
    }

    #[test]
    fn test_preset_row_roundtrip() {
        let preset = Preset::recommended();
        let row = PresetRow::from_preset(&preset).unwrap();
        assert_eq!(row.into_preset().unwrap(), preset);
    }
}
