//! Run history.
//!
//! Every non-dry sync inserts a `running` row into `sync_runs` before it
//! authenticates and finalizes it as `committed` or `failed`. `qbo-sync runs`
//! prints the most recent rows.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::RunFailure;
use crate::migrate;
use crate::models::{ResourceDescriptor, SyncReport, TimeWindow};

/// One row of `sync_runs`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: String,
    pub resource: String,
    pub target_table: String,
    pub window_start: String,
    pub window_end: String,
    pub status: String,
    pub records: i64,
    pub pages: i64,
    pub requests: i64,
    pub rate_limited: i64,
    pub rotation_observed: bool,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

pub async fn start_run(
    pool: &SqlitePool,
    resource: &ResourceDescriptor,
    window: &TimeWindow,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO sync_runs (id, resource, target_table, window_start, window_end, status, started_at)
        VALUES (?, ?, ?, ?, ?, 'running', ?)
        "#,
    )
    .bind(&id)
    .bind(&resource.name)
    .bind(resource.qualified_table())
    .bind(window.start_label())
    .bind(window.end_label())
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn finish_run(pool: &SqlitePool, id: &str, report: &SyncReport) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_runs SET
            status = 'committed',
            records = ?,
            pages = ?,
            requests = ?,
            rate_limited = ?,
            rotation_observed = ?,
            finished_at = ?
        WHERE id = ?
        "#,
    )
    .bind(report.committed as i64)
    .bind(report.pages as i64)
    .bind(report.requests as i64)
    .bind(report.rate_limited as i64)
    .bind(report.rotation_observed)
    .bind(report.finished_at.timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail_run(pool: &SqlitePool, id: &str, failure: &RunFailure) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_runs SET
            status = 'failed',
            records = ?,
            pages = ?,
            requests = ?,
            rate_limited = ?,
            rotation_observed = ?,
            error_kind = ?,
            error = ?,
            finished_at = ?
        WHERE id = ?
        "#,
    )
    .bind(failure.committed as i64)
    .bind(failure.stats.pages as i64)
    .bind(failure.stats.requests as i64)
    .bind(failure.stats.rate_limited as i64)
    .bind(failure.new_refresh_token.is_some())
    .bind(failure.error.kind())
    .bind(failure.error.to_string())
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent runs first, optionally for one resource.
pub async fn list_runs(
    pool: &SqlitePool,
    resource: Option<&str>,
    limit: i64,
) -> Result<Vec<RunSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT id, resource, target_table, window_start, window_end, status, records, pages,
               requests, rate_limited, rotation_observed, error_kind, error, started_at, finished_at
        FROM sync_runs
        WHERE (? IS NULL OR resource = ?)
        ORDER BY started_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(resource)
    .bind(resource)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| RunSummary {
            id: r.get("id"),
            resource: r.get("resource"),
            target_table: r.get("target_table"),
            window_start: r.get("window_start"),
            window_end: r.get("window_end"),
            status: r.get("status"),
            records: r.get("records"),
            pages: r.get("pages"),
            requests: r.get("requests"),
            rate_limited: r.get("rate_limited"),
            rotation_observed: r.get("rotation_observed"),
            error_kind: r.get("error_kind"),
            error: r.get("error"),
            started_at: r.get("started_at"),
            finished_at: r.get("finished_at"),
        })
        .collect())
}

/// `qbo-sync runs`: print recent run history.
pub async fn run_list(config: &Config, resource: Option<String>, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_control_schema(&pool).await?;
    let runs = list_runs(&pool, resource.as_deref(), limit.max(1)).await?;
    pool.close().await;

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<23} {:<10} {:>8} {:>6} {:>5}",
        "STARTED", "RESOURCE", "WINDOW", "STATUS", "RECORDS", "PAGES", "429S"
    );
    for run in &runs {
        let started = Utc
            .timestamp_opt(run.started_at, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| run.started_at.to_string());
        println!(
            "{:<20} {:<12} {:<23} {:<10} {:>8} {:>6} {:>5}",
            started,
            run.resource,
            format!("{}..{}", run.window_start, run.window_end),
            run.status,
            run.records,
            run.pages,
            run.rate_limited
        );
        if run.rotation_observed {
            println!("  refresh token rotated during this run");
        }
        if let Some(ref err) = run.error {
            println!(
                "  error ({}): {}",
                run.error_kind.as_deref().unwrap_or("unknown"),
                err
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::extract::ExtractStats;
    use crate::models::RunState;
    use chrono::FixedOffset;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;
    use tempfile::TempDir;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{}",
            tmp.path().join("control.sqlite").display()
        ))
        .unwrap()
        .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        migrate::ensure_control_schema(&pool).await.unwrap();
        pool
    }

    fn window() -> TimeWindow {
        TimeWindow::parse("2024-01-01", "2024-01-31", FixedOffset::east_opt(0).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn committed_run_is_recorded() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let invoices = ResourceDescriptor::new("invoices", "Invoice", "qb_invoices");

        let id = start_run(&pool, &invoices, &window()).await.unwrap();
        let running = list_runs(&pool, None, 10).await.unwrap();
        assert_eq!(running[0].status, "running");

        let now = Utc::now();
        let report = SyncReport {
            resource: "invoices".into(),
            table: invoices.qualified_table(),
            window_start: "2024-01-01".into(),
            window_end: "2024-01-31".into(),
            records: 150,
            committed: 150,
            pages: 2,
            requests: 3,
            rate_limited: 1,
            rotation_observed: true,
            new_refresh_token: Some("rt-2".into()),
            dry_run: false,
            started_at: now,
            finished_at: now,
        };
        finish_run(&pool, &id, &report).await.unwrap();

        let runs = list_runs(&pool, Some("invoices"), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.status, "committed");
        assert_eq!(run.records, 150);
        assert_eq!(run.pages, 2);
        assert_eq!(run.rate_limited, 1);
        assert!(run.rotation_observed);
        assert_eq!(run.target_table, "raw.qb_invoices");
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn failed_run_keeps_error_text() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let items = ResourceDescriptor::new("items", "Item", "qb_items");

        let id = start_run(&pool, &items, &window()).await.unwrap();
        let failure = RunFailure {
            error: SyncError::Auth {
                status: 401,
                body: "invalid_grant".into(),
            },
            failed_in: RunState::Authenticating,
            new_refresh_token: None,
            stats: ExtractStats::default(),
            committed: 0,
        };
        fail_run(&pool, &id, &failure).await.unwrap();

        let runs = list_runs(&pool, Some("items"), 10).await.unwrap();
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].error_kind.as_deref(), Some("auth"));
        assert!(runs[0].error.as_deref().unwrap().contains("invalid_grant"));
        assert!(list_runs(&pool, Some("invoices"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_run_records_partial_work() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let invoices = ResourceDescriptor::new("invoices", "Invoice", "qb_invoices");

        let id = start_run(&pool, &invoices, &window()).await.unwrap();
        let failure = RunFailure {
            error: SyncError::Extraction {
                resource: "Invoice".into(),
                status: 500,
                body: "boom".into(),
            },
            failed_in: RunState::Extracting,
            new_refresh_token: None,
            stats: ExtractStats {
                requests: 4,
                rate_limited: 1,
                pages: 2,
                records: 200,
            },
            committed: 200,
        };
        fail_run(&pool, &id, &failure).await.unwrap();

        let run = &list_runs(&pool, None, 10).await.unwrap()[0];
        assert_eq!(run.status, "failed");
        assert_eq!(run.records, 200);
        assert_eq!(run.pages, 2);
        assert_eq!(run.requests, 4);
        assert_eq!(run.rate_limited, 1);
    }
}
