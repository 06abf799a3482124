use std::path::Path;

use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tokio::fs;

use crate::SandcoreResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the sandbox database
pub static SANDBOX_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/management/migrations/sandbox");

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Initializes the SQLite database at `db_path`, creating the file if needed, and runs the
/// migrations.
pub async fn init_db(
    db_path: impl AsRef<Path>,
    migrator: &Migrator,
) -> SandcoreResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    if !db_path.exists() {
        fs::File::create(&db_path).await?;
    }

    let pool = get_db_pool(db_path).await?;
    migrator.run(&pool).await?;

    tracing::debug!(path = %db_path.display(), "database ready");
    Ok(pool)
}

/// Creates a connection pool of at most 5 connections to the database at `db_path`.
pub async fn get_db_pool(db_path: impl AsRef<Path>) -> SandcoreResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await?;

    Ok(pool)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
