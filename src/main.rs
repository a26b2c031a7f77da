//! # qbo-sync CLI
//!
//! ## Usage
//!
//! ```bash
//! qbo-sync --config ./config/qbo-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qbo-sync init` | Create the control database and run-history table |
//! | `qbo-sync resources` | List configured resources, row counts, credential health |
//! | `qbo-sync sync <resource\|all>` | Sync one window for one or every resource |
//! | `qbo-sync runs` | Show recent run history |
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=qbo_sync=debug`) for diagnostic logs on stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use qbo_sync::progress::ProgressMode;
use qbo_sync::{config, ingest, migrate, resources, runs};

/// qbo-sync: incremental raw-layer sync of QuickBooks Online resources.
#[derive(Parser)]
#[command(
    name = "qbo-sync",
    about = "qbo-sync: incremental, idempotent raw-layer sync of QuickBooks Online resources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qbo-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the control database.
    ///
    /// Idempotent. Raw tables are created on first sync.
    Init,

    /// List configured resources, their raw tables and row counts.
    Resources,

    /// Extract one time window from the API and upsert it.
    ///
    /// Resource format: a configured name (`invoices`, `items`) or `all`.
    Sync {
        /// Resource name, or `all`.
        resource: String,

        /// First day of the window (YYYY-MM-DD), inclusive.
        #[arg(long, alias = "window-start")]
        since: String,

        /// Last day of the window (YYYY-MM-DD), inclusive.
        #[arg(long, alias = "window-end")]
        until: String,

        /// Extract and envelope without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to human on a TTY, off otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show recent sync runs.
    Runs {
        /// Only show runs for this resource.
        #[arg(long)]
        resource: Option<String>,

        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Resources => {
            resources::list_resources(&cfg).await?;
        }
        Commands::Sync {
            resource,
            since,
            until,
            dry_run,
            progress,
        } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_sync(&cfg, &resource, &since, &until, dry_run, mode).await?;
        }
        Commands::Runs { resource, limit } => {
            runs::run_list(&cfg, resource, limit).await?;
        }
    }

    Ok(())
}
