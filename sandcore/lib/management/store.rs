use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};

use crate::{
    models::{Sandbox, SandboxStatus},
    providers::SandboxStore,
    SandcoreResult,
};

use super::{init_db, SANDBOX_DB_MIGRATOR};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Sandbox records in SQLite. The runtime block is stored as JSON.
#[derive(Debug, Clone)]
pub struct SqliteSandboxStore {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SqliteSandboxStore {
    /// Opens, and if needed creates and migrates, the database at `db_path`.
    pub async fn open(db_path: impl AsRef<Path>) -> SandcoreResult<Self> {
        let pool = init_db(db_path, &SANDBOX_DB_MIGRATOR).await?;
        Ok(Self { pool })
    }

    /// Wraps an already migrated pool.
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxStore for SqliteSandboxStore {
    async fn create(&self, sandbox: &Sandbox) -> SandcoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (id, status, workspace_id, runtime_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sandbox.id)
        .bind(sandbox.status.as_str())
        .bind(&sandbox.workspace_id)
        .bind(serde_json::to_string(&sandbox.runtime)?)
        .bind(sandbox.created_at)
        .bind(sandbox.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> SandcoreResult<Option<Sandbox>> {
        let row = sqlx::query("SELECT * FROM sandboxes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| sandbox_from_row(&row)).transpose()
    }

    async fn update(&self, sandbox: &Sandbox) -> SandcoreResult<Option<Sandbox>> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = ?, workspace_id = ?, runtime_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(sandbox.status.as_str())
        .bind(&sandbox.workspace_id)
        .bind(serde_json::to_string(&sandbox.runtime)?)
        .bind(Utc::now())
        .bind(&sandbox.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(&sandbox.id).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: SandboxStatus,
        error: Option<String>,
    ) -> SandcoreResult<Option<Sandbox>> {
        let Some(mut sandbox) = self.get(id).await? else {
            return Ok(None);
        };

        sandbox.status = status;
        sandbox.runtime.error = error;
        self.update(&sandbox).await
    }

    async fn delete(&self, id: &str) -> SandcoreResult<bool> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> SandcoreResult<Vec<Sandbox>> {
        let rows = sqlx::query("SELECT * FROM sandboxes ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(sandbox_from_row).collect()
    }

    async fn count_by_status(&self, status: SandboxStatus) -> SandcoreResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM sandboxes WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get::<i64, _>("count") as usize)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn sandbox_from_row(row: &SqliteRow) -> SandcoreResult<Sandbox> {
    Ok(Sandbox {
        id: row.get("id"),
        status: row.get::<String, _>("status").parse()?,
        workspace_id: row.get("workspace_id"),
        runtime: serde_json::from_str(&row.get::<String, _>("runtime_json"))?,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
