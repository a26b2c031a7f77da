//! # qbo-sync
//!
//! Incremental, idempotent raw-layer sync of QuickBooks Online resources
//! (invoices, items, or any similarly shaped entity) into SQLite.
//!
//! Each run refreshes an OAuth2 access token, pages through the remote query
//! API for one resource type and one date window, wraps every raw payload in
//! an envelope with ingestion metadata, and upserts the batch into
//! `raw.<table>` inside a single transaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │ Credentials │──▶│ TokenManager│──▶│ Extractor │──▶│ Envelope │──▶│   Sink   │
//! │  env/file   │   │ OAuth2 RT   │   │ paginated │   │ metadata │   │ upsert tx│
//! └─────────────┘   └─────────────┘   └───────────┘   └──────────┘   └──────────┘
//!                           └────────────── SyncRunner ───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qbo-sync init
//! qbo-sync sync invoices --since 2024-01-01 --until 2024-01-31
//! qbo-sync sync all --since 2024-01-01 --until 2024-01-31
//! qbo-sync resources
//! qbo-sync runs --limit 10
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`credentials`] | Secret lookup backends |
//! | [`auth`] | Refresh-token exchange |
//! | [`extract`] | Paginated, rate-limit-aware extraction |
//! | [`envelope`] | Raw payload → persistence record |
//! | [`sink`] | Transactional upsert into `raw.*` |
//! | [`ingest`] | Run orchestration |
//! | [`progress`] | Progress reporting |
//! | [`runs`] | Run history |
//! | [`resources`] | Resource listing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Control schema |

pub mod auth;
pub mod config;
pub mod credentials;
pub mod db;
pub mod envelope;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod resources;
pub mod runs;
pub mod sink;
