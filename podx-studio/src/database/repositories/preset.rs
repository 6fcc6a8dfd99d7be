//! Preset repository.

use async_trait::async_trait;

use crate::database::DbPool;
use crate::database::models::PresetRow;
use crate::database::time::now_ms;
use crate::domain::{Preset, RECOMMENDED_PRESET};
use crate::{Error, Result};

/// Persistence of named presets.
#[async_trait]
pub trait PresetRepository: Send + Sync {
    /// All presets, the built-in one first, then by name.
    async fn list_presets(&self) -> Result<Vec<Preset>>;
    async fn get_preset(&self, name: &str) -> Result<Option<Preset>>;
    /// Fails when a preset with the same name exists.
    async fn create_preset(&self, preset: &Preset) -> Result<()>;
    /// Fails when no preset with that name exists.
    async fn update_preset(&self, preset: &Preset) -> Result<()>;
    /// The built-in preset cannot be deleted.
    async fn delete_preset(&self, name: &str) -> Result<()>;
    /// Store the built-in preset if it is missing.
    async fn ensure_builtin(&self) -> Result<()>;
}

/// SQLite implementation of [`PresetRepository`].
pub struct SqlxPresetRepository {
    pool: DbPool,
}

impl SqlxPresetRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresetRepository for SqlxPresetRepository {
    async fn list_presets(&self) -> Result<Vec<Preset>> {
        let rows = sqlx::query_as::<_, PresetRow>(
            r#"
            SELECT * FROM presets
            ORDER BY CASE WHEN name = $1 THEN 0 ELSE 1 END, name COLLATE NOCASE
            "#,
        )
        .bind(RECOMMENDED_PRESET)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PresetRow::into_preset).collect()
    }

    async fn get_preset(&self, name: &str) -> Result<Option<Preset>> {
        let row = sqlx::query_as::<_, PresetRow>("SELECT * FROM presets WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PresetRow::into_preset).transpose()
    }

    async fn create_preset(&self, preset: &Preset) -> Result<()> {
        let row = PresetRow::from_preset(preset)?;
        let result = sqlx::query(
            r#"
            INSERT INTO presets (name, options, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&row.name)
        .bind(&row.options)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::validation(format!(
                "A preset named '{}' already exists",
                preset.name
            )));
        }
        Ok(())
    }

    async fn update_preset(&self, preset: &Preset) -> Result<()> {
        let options = serde_json::to_string(&preset.options)?;
        let result = sqlx::query("UPDATE presets SET options = $1, updated_at = $2 WHERE name = $3")
            .bind(options)
            .bind(now_ms())
            .bind(&preset.name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Preset", &preset.name));
        }
        Ok(())
    }

    async fn delete_preset(&self, name: &str) -> Result<()> {
        if name == RECOMMENDED_PRESET {
            return Err(Error::validation(format!(
                "The built-in preset '{}' cannot be deleted",
                RECOMMENDED_PRESET
            )));
        }

        let result = sqlx::query("DELETE FROM presets WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Preset", name));
        }
        Ok(())
    }

    async fn ensure_builtin(&self) -> Result<()> {
        let row = PresetRow::from_preset(&Preset::recommended())?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO presets (name, options, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&row.name)
        .bind(&row.options)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
