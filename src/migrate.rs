use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the control schema. Safe to run repeatedly.
///
/// Raw tables are not created here: the sink creates each one on first
/// write, so adding a resource needs no migration.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_control_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn ensure_control_schema(pool: &SqlitePool) -> Result<()> {
    // Create run history table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            resource TEXT NOT NULL,
            target_table TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            status TEXT NOT NULL,
            records INTEGER NOT NULL DEFAULT 0,
            pages INTEGER NOT NULL DEFAULT 0,
            requests INTEGER NOT NULL DEFAULT 0,
            rate_limited INTEGER NOT NULL DEFAULT 0,
            rotation_observed INTEGER NOT NULL DEFAULT 0,
            error_kind TEXT,
            error TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_runs_resource ON sync_runs(resource, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
