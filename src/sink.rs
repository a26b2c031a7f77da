//! Idempotent, transactional persistence of extracted records.
//!
//! Every resource type lands in its own table inside the `raw` schema. In
//! SQLite the schema is an attached database file (`db.raw_path`); the sink
//! attaches it on whichever pooled connection it is about to use, then runs
//! DDL and the upsert inside one transaction on that connection.
//!
//! # Table layout
//!
//! | Column | Type | Notes |
//! |--------|------|-------|
//! | `id` | `TEXT PRIMARY KEY` | natural key, 1–50 chars |
//! | `payload` | `TEXT` | must be valid JSON |
//! | `ingested_at` | `TEXT` | RFC 3339 UTC |
//! | `window_start` | `TEXT` | `YYYY-MM-DD` |
//! | `window_end` | `TEXT` | `YYYY-MM-DD` |
//! | `page_number` | `INTEGER` | ≥ 1 |
//!
//! # Semantics
//!
//! - Conflicts on `id` overwrite every other column (last write wins).
//! - One call is one transaction: any failing row rolls back the whole batch.

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::{Connection, QueryBuilder, Row, Sqlite};
use std::path::{Path, PathBuf};

use crate::config::{is_sql_identifier, Config};
use crate::db;
use crate::error::SyncError;
use crate::models::{ExtractedRecord, RAW_SCHEMA};

/// Rows per `INSERT` statement. Six binds per row keeps each statement under
/// SQLite's historical 999-parameter limit.
const ROWS_PER_STATEMENT: usize = 150;

pub struct IdempotentSink {
    pool: SqlitePool,
    raw_path: PathBuf,
}

impl IdempotentSink {
    pub fn new(pool: SqlitePool, raw_path: PathBuf) -> Self {
        Self { pool, raw_path }
    }

    /// Connect using the `[db]` section of the config.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        Ok(Self::new(pool, config.db.raw_path()))
    }

    /// The underlying control-database pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn acquire(&self) -> Result<PoolConnection<Sqlite>, SyncError> {
        let mut conn = self.pool.acquire().await?;
        ensure_namespace(&mut conn, &self.raw_path).await?;
        Ok(conn)
    }

    /// Create the table if needed and upsert `records` in one transaction.
    ///
    /// Returns the number of records written.
    pub async fn upsert(&self, table: &str, records: &[ExtractedRecord]) -> Result<u64, SyncError> {
        check_table(table)?;
        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;

        match write_batch(&mut tx, table, records).await {
            Ok(()) => {
                tx.commit().await?;
                tracing::info!(table, rows = records.len(), "batch committed");
                Ok(records.len() as u64)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(table, "rollback failed: {}", rollback_err);
                }
                tracing::warn!(table, rows = records.len(), "batch rolled back: {}", e);
                Err(e)
            }
        }
    }

    /// Number of rows in `raw.<table>`; 0 when the table does not exist yet.
    pub async fn count(&self, table: &str) -> Result<i64, SyncError> {
        check_table(table)?;
        let mut conn = self.acquire().await?;
        if !table_exists(&mut conn, table).await? {
            return Ok(0);
        }
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}.{}", RAW_SCHEMA, table))
            .fetch_one(&mut *conn)
            .await?;
        Ok(n)
    }

    /// Load one row by natural key.
    pub async fn fetch(&self, table: &str, id: &str) -> Result<Option<ExtractedRecord>, SyncError> {
        check_table(table)?;
        let mut conn = self.acquire().await?;
        if !table_exists(&mut conn, table).await? {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT id, payload, ingested_at, window_start, window_end, page_number \
             FROM {}.{} WHERE id = ?",
            RAW_SCHEMA, table
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|r| ExtractedRecord {
            id: r.get("id"),
            payload: r.get("payload"),
            ingested_at: r.get("ingested_at"),
            window_start: r.get("window_start"),
            window_end: r.get("window_end"),
            page_number: r.get("page_number"),
        }))
    }
}

fn check_table(table: &str) -> Result<(), SyncError> {
    if is_sql_identifier(table) {
        Ok(())
    } else {
        Err(SyncError::Persistence(sqlx::Error::Configuration(
            format!("invalid table name '{}'", table).into(),
        )))
    }
}

/// Attach the `raw` database to this connection unless it already is.
///
/// `ATTACH` is not allowed inside a transaction, so this runs before `BEGIN`.
async fn ensure_namespace(conn: &mut SqliteConnection, raw_path: &Path) -> Result<(), SyncError> {
    let attached: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_database_list WHERE name = ?")
            .bind(RAW_SCHEMA)
            .fetch_one(&mut *conn)
            .await?;
    if attached > 0 {
        return Ok(());
    }

    if let Some(parent) = raw_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }

    sqlx::query(&format!("ATTACH DATABASE ? AS {}", RAW_SCHEMA))
        .bind(raw_path.display().to_string())
        .execute(&mut *conn)
        .await?;
    tracing::debug!(path = %raw_path.display(), "attached raw schema");
    Ok(())
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, SyncError> {
    let exists: bool = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) > 0 FROM {}.sqlite_master WHERE type = 'table' AND name = ?",
        RAW_SCHEMA
    ))
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

async fn create_table(conn: &mut SqliteConnection, table: &str) -> Result<(), SyncError> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.{} (
            id TEXT PRIMARY KEY CHECK (length(id) BETWEEN 1 AND 50),
            payload TEXT NOT NULL CHECK (json_valid(payload)),
            ingested_at TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            page_number INTEGER NOT NULL CHECK (page_number >= 1)
        )
        "#,
        RAW_SCHEMA, table
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_batch(
    conn: &mut SqliteConnection,
    table: &str,
    records: &[ExtractedRecord],
) -> Result<(), SyncError> {
    create_table(conn, table).await?;

    for chunk in records.chunks(ROWS_PER_STATEMENT) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {}.{} (id, payload, ingested_at, window_start, window_end, page_number) ",
            RAW_SCHEMA, table
        ));
        qb.push_values(chunk, |mut row, rec| {
            row.push_bind(rec.id.clone())
                .push_bind(rec.payload.clone())
                .push_bind(rec.ingested_at.clone())
                .push_bind(rec.window_start.clone())
                .push_bind(rec.window_end.clone())
                .push_bind(rec.page_number);
        });
        qb.push(
            r#"
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                ingested_at = excluded.ingested_at,
                window_start = excluded.window_start,
                window_end = excluded.window_end,
                page_number = excluded.page_number
            "#,
        );
        qb.build().execute(&mut *conn).await?;
    }

    Ok(())
}
