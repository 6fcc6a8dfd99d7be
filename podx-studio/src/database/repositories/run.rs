//! Run history repository.

use async_trait::async_trait;
use tracing::warn;

use crate::Result;
use crate::database::DbPool;
use crate::database::models::RunRow;
use crate::domain::{Run, RunId};

/// Maximum number of runs returned by a history listing.
pub const MAX_RECENT_RUNS: usize = 20;

/// Persistence of runs.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert or replace the stored state of a run.
    async fn save_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>>;

    /// Most recent runs, newest first, at most [`MAX_RECENT_RUNS`].
    async fn list_recent(&self, limit: usize) -> Result<Vec<Run>>;

    /// Runs stored in a non-terminal status.
    async fn list_unfinished(&self) -> Result<Vec<Run>>;
}

/// SQLite implementation of [`RunRepository`].
pub struct SqlxRunRepository {
    pool: DbPool,
}

impl SqlxRunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Decode rows, skipping (and logging) any that no longer parse.
    fn decode(rows: Vec<RunRow>) -> Vec<Run> {
        rows.into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match row.into_run() {
                    Ok(run) => Some(run),
                    Err(e) => {
                        warn!(run_id = %id, error = %e, "Skipping unreadable run record");
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl RunRepository for SqlxRunRepository {
    async fn save_run(&self, run: &Run) -> Result<()> {
        let row = RunRow::from_run(run)?;
        sqlx::query(
            r#"
            INSERT INTO runs (id, status, source_url, created_at, completed_at, retry_of, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                data = excluded.data
            "#,
        )
        .bind(&row.id)
        .bind(&row.status)
        .bind(&row.source_url)
        .bind(row.created_at)
        .bind(row.completed_at)
        .bind(&row.retry_of)
        .bind(&row.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM runs WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRow::into_run).transpose()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Run>> {
        let limit = limit.min(MAX_RECENT_RUNS) as i64;
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM runs ORDER BY created_at DESC, rowid DESC LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::decode(rows))
    }

    async fn list_unfinished(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM runs WHERE status IN ('queued', 'running') ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::decode(rows))
    }
}
