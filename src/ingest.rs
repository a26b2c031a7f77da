//! Sync pipeline orchestration.
//!
//! A [`SyncRunner`] executes one run for one resource type and one window:
//!
//! ```text
//! Idle → Authenticating → Extracting → Persisting → Committed
//!              │               │            │
//!              └───────────────┴────────────┴──────→ Failed
//! ```
//!
//! credentials → access token → raw pages → envelopes → committed rows.
//! Rate-limit retries happen inside `Extracting`; no state is re-entered.
//!
//! With `sync.commit = "page"` each page is enveloped and committed as soon
//! as it arrives, inside `Extracting`, and the run moves straight to
//! `Committed` afterwards. Atomicity is then per page.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::auth::TokenManager;
use crate::config::{CommitMode, Config};
use crate::credentials::{self, CredentialStore, OverlayCredentialStore};
use crate::envelope;
use crate::error::{RunFailure, SyncError};
use crate::extract::{ExtractStats, PaginatedExtractor};
use crate::migrate;
use crate::models::{ExtractedRecord, RawPage, ResourceDescriptor, RunState, SyncReport, TimeWindow};
use crate::progress::{ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::runs;
use crate::sink::IdempotentSink;

/// Options for a single run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Authenticate, extract and envelope, but leave the target store alone.
    pub dry_run: bool,
}

pub struct SyncRunner<'a> {
    config: &'a Config,
    credentials: &'a dyn CredentialStore,
    sink: &'a IdempotentSink,
    progress: &'a dyn SyncProgressReporter,
}

/// Mutable bookkeeping for one run.
struct RunContext<'r> {
    resource: &'r ResourceDescriptor,
    state: RunState,
    new_refresh_token: Option<String>,
    stats: ExtractStats,
    committed: u64,
}

impl<'a> SyncRunner<'a> {
    pub fn new(
        config: &'a Config,
        credentials: &'a dyn CredentialStore,
        sink: &'a IdempotentSink,
        progress: &'a dyn SyncProgressReporter,
    ) -> Self {
        Self {
            config,
            credentials,
            sink,
            progress,
        }
    }

    /// Run the pipeline once for `resource` over `window`.
    pub async fn run(
        &self,
        resource: &ResourceDescriptor,
        window: &TimeWindow,
        options: RunOptions,
    ) -> Result<SyncReport, RunFailure> {
        let mut ctx = RunContext {
            resource,
            state: RunState::Idle,
            new_refresh_token: None,
            stats: ExtractStats::default(),
            committed: 0,
        };

        match self.execute(&mut ctx, window, options).await {
            Ok(report) => {
                self.enter(&mut ctx, RunState::Committed);
                Ok(report)
            }
            Err(error) => {
                let failed_in = ctx.state;
                self.enter(&mut ctx, RunState::Failed);
                tracing::error!(
                    resource = %resource.name,
                    state = %failed_in,
                    kind = error.kind(),
                    "run failed: {}",
                    error
                );
                Err(RunFailure {
                    error,
                    failed_in,
                    new_refresh_token: ctx.new_refresh_token,
                    stats: ctx.stats,
                    committed: ctx.committed,
                })
            }
        }
    }

    async fn execute(
        &self,
        ctx: &mut RunContext<'_>,
        window: &TimeWindow,
        options: RunOptions,
    ) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let resource = ctx.resource;

        // 1-2. Credentials and access token
        self.enter(ctx, RunState::Authenticating);
        let names = &self.config.credentials;
        let credential = credentials::resolve_refresh_credential(self.credentials, names)?;
        let realm_id = self.credentials.get_secret_value(&names.realm_id)?;
        let grant = TokenManager::new(&self.config.auth)?
            .acquire_access_token(&credential)
            .await?;
        ctx.new_refresh_token = grant.new_refresh_token.clone();

        // 3. Extraction
        self.enter(ctx, RunState::Extracting);
        let extractor = PaginatedExtractor::new(&self.config.api)?;
        let mut cursor = extractor.pages(
            resource,
            window,
            &grant.access_token,
            &realm_id,
            self.progress,
        );

        let per_page = self.config.sync.commit == CommitMode::Page && !options.dry_run;
        let mut pages: Vec<RawPage> = Vec::new();
        let mut committed = 0u64;
        let drained: Result<(), SyncError> = async {
            while let Some(page) = cursor.next_page().await? {
                if per_page {
                    let records =
                        envelope::wrap_page(&page.records, resource, window, page.page_number())?;
                    committed += self.sink.upsert(&resource.table, &records).await?;
                } else {
                    pages.push(page);
                }
            }
            Ok(())
        }
        .await;
        // Pages committed before a failure stay committed; record them either way.
        let stats = cursor.stats();
        ctx.stats = stats;
        ctx.committed = committed;
        drained?;

        // 4-5. Envelope and persist the whole window
        if !per_page {
            let mut records: Vec<ExtractedRecord> = Vec::with_capacity(stats.records as usize);
            for page in &pages {
                records.extend(envelope::wrap_page(
                    &page.records,
                    resource,
                    window,
                    page.page_number(),
                )?);
            }
            drop(pages);

            if !options.dry_run {
                self.enter(ctx, RunState::Persisting);
                committed = self.sink.upsert(&resource.table, &records).await?;
                ctx.committed = committed;
            }
        }

        // 6. Report
        Ok(SyncReport {
            resource: resource.name.clone(),
            table: resource.qualified_table(),
            window_start: window.start_label(),
            window_end: window.end_label(),
            records: stats.records,
            committed,
            pages: stats.pages,
            requests: stats.requests,
            rate_limited: stats.rate_limited,
            rotation_observed: grant.rotation_observed,
            new_refresh_token: grant.new_refresh_token,
            dry_run: options.dry_run,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn enter(&self, ctx: &mut RunContext<'_>, next: RunState) {
        debug_assert!(!ctx.state.is_terminal(), "run already finished");
        tracing::debug!(resource = %ctx.resource.name, from = %ctx.state, to = %next, "state");
        ctx.state = next;
        self.progress.report(SyncProgressEvent::State {
            resource: ctx.resource.name.clone(),
            state: next,
        });
    }
}

/// `qbo-sync sync`: run one resource, or every configured resource for `all`.
///
/// Resources run in name order and the command stops at the first failure.
/// A refresh token rotated by one run is used by the runs after it.
pub async fn run_sync(
    config: &Config,
    target: &str,
    since: &str,
    until: &str,
    dry_run: bool,
    progress: ProgressMode,
) -> Result<()> {
    let window = TimeWindow::parse(since, until, config.api.offset())?;
    let resources = if target == "all" {
        config.resources()
    } else {
        vec![config.resource(target)?]
    };

    let store = credentials::open_store(&config.credentials)?;
    let overlay = OverlayCredentialStore::new(store.as_ref());
    let sink = IdempotentSink::open(config).await?;
    migrate::ensure_control_schema(sink.pool()).await?;
    let reporter = progress.reporter();
    let runner = SyncRunner::new(config, &overlay, &sink, reporter.as_ref());
    let options = RunOptions { dry_run };

    for resource in &resources {
        let run_id = if dry_run {
            None
        } else {
            Some(runs::start_run(sink.pool(), resource, &window).await?)
        };

        match runner.run(resource, &window, options).await {
            Ok(report) => {
                if let Some(ref id) = run_id {
                    runs::finish_run(sink.pool(), id, &report).await?;
                }
                if let Some(ref token) = report.new_refresh_token {
                    overlay.set(&config.credentials.refresh_token, token);
                }
                print_report(config, &report);
            }
            Err(failure) => {
                if let Some(ref id) = run_id {
                    runs::fail_run(sink.pool(), id, &failure).await?;
                }
                if let Some(ref token) = failure.new_refresh_token {
                    print_rotation(config, token);
                }
                sink.close().await;
                return Err(failure).with_context(|| {
                    format!("sync {} failed", resource.name)
                });
            }
        }
    }

    sink.close().await;
    Ok(())
}

fn print_report(config: &Config, report: &SyncReport) {
    if report.dry_run {
        println!("sync {} (dry-run)", report.resource);
    } else {
        println!("sync {}", report.resource);
    }
    println!("  table: {}", report.table);
    println!("  window: {}..{}", report.window_start, report.window_end);
    println!("  requests: {}", report.requests);
    println!("  rate limited: {}", report.rate_limited);
    println!("  pages: {}", report.pages);
    println!("  records: {}", report.records);
    if !report.dry_run {
        println!("  upserted: {}", report.committed);
    }
    if let Some(ref token) = report.new_refresh_token {
        print_rotation(config, token);
    }
    println!("ok");
}

/// Print a rotated refresh token on its own line so an operator or a
/// wrapper script can store it.
fn print_rotation(config: &Config, token: &str) {
    println!("  rotated refresh token: {}", token);
    println!(
        "  (update secret {} before the next run)",
        config.credentials.refresh_token
    );
}
