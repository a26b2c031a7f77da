//! Core data models used throughout the sync pipeline.
//!
//! These types follow one run from left to right: a [`RefreshCredential`]
//! is exchanged for an [`AccessToken`], the extractor yields [`RawPage`]s for
//! a [`ResourceDescriptor`] and [`TimeWindow`], each raw object becomes an
//! [`ExtractedRecord`], and the run ends with a [`SyncReport`].

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::SyncError;

/// Schema (attached database) that holds every raw table.
pub const RAW_SCHEMA: &str = "raw";

/// Everything that differs between one remote resource type and another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Configured name, used on the command line (e.g. `invoices`).
    pub name: String,
    /// Entity name in the remote query language (e.g. `Invoice`).
    pub type_name: String,
    /// Table inside the `raw` schema (e.g. `qb_invoices`).
    pub table: String,
    /// Key under `QueryResponse` that holds the records.
    pub query_key: String,
    /// Field carrying the natural identifier.
    pub id_field: String,
}

impl ResourceDescriptor {
    pub fn new(name: &str, type_name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            table: table.to_string(),
            query_key: type_name.to_string(),
            id_field: "Id".to_string(),
        }
    }

    /// Descriptors used when the config declares no resources.
    pub fn builtin() -> Vec<Self> {
        vec![
            Self::new("invoices", "Invoice", "qb_invoices"),
            Self::new("items", "Item", "qb_items"),
        ]
    }

    /// Schema-qualified table name, e.g. `raw.qb_invoices`.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", RAW_SCHEMA, self.table)
    }
}

/// Inclusive date range filtering remote records by last-modified time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub offset: FixedOffset,
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate, offset: FixedOffset) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::InvalidWindow(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end, offset })
    }

    /// Parse caller-supplied `YYYY-MM-DD` dates.
    pub fn parse(start: &str, end: &str, offset: FixedOffset) -> Result<Self, SyncError> {
        let parse_date = |label: &str, s: &str| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
                SyncError::InvalidWindow(format!("{} '{}' is not YYYY-MM-DD: {}", label, s, e))
            })
        };
        Self::new(
            parse_date("start", start)?,
            parse_date("end", end)?,
            offset,
        )
    }

    /// First instant of the window: `start` at 00:00:00 in the window offset.
    pub fn lower_bound(&self) -> DateTime<FixedOffset> {
        self.at(self.start, 0, 0, 0)
    }

    /// Last instant of the window: `end` at 23:59:59 in the window offset.
    pub fn upper_bound(&self) -> DateTime<FixedOffset> {
        self.at(self.end, 23, 59, 59)
    }

    fn at(&self, date: NaiveDate, h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        // A fixed offset has no gaps or folds, so the local time always maps.
        let naive = date.and_hms_opt(h, m, s).unwrap_or_default();
        self.offset.from_utc_datetime(&(naive - self.offset))
    }

    /// Start date as echoed into every record.
    pub fn start_label(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    /// End date as echoed into every record.
    pub fn end_label(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

/// Format a bound the way the query language expects it: `2024-01-01T00:00:00-05:00`.
pub fn format_bound(dt: &DateTime<FixedOffset>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Client credentials plus the refresh token to exchange.
#[derive(Clone)]
pub struct RefreshCredential {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for RefreshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &fingerprint(&self.refresh_token))
            .finish()
    }
}

/// Short SHA-256 fingerprint of a secret, safe to log and compare.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Bearer token for one run. Never persisted.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    /// Fingerprint of the refresh token that issued this access token.
    pub issued_by: String,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("issued_by", &self.issued_by)
            .finish()
    }
}

/// Outcome of a refresh-token exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: AccessToken,
    pub rotation_observed: bool,
    /// Present only when the provider issued a different refresh token.
    pub new_refresh_token: Option<String>,
}

/// One page of raw resource objects as returned by the query endpoint.
#[derive(Debug, Clone)]
pub struct RawPage {
    /// Each object's JSON text exactly as the API sent it.
    pub records: Vec<Box<serde_json::value::RawValue>>,
    /// 1-based `STARTPOSITION` used for the request.
    pub start_position: u32,
    pub page_size: u32,
}

impl RawPage {
    /// `floor((start_position - 1) / page_size) + 1`.
    pub fn page_number(&self) -> u32 {
        page_number(self.start_position, self.page_size)
    }
}

pub fn page_number(start_position: u32, page_size: u32) -> u32 {
    (start_position.saturating_sub(1)) / page_size.max(1) + 1
}

/// A raw payload wrapped with ingestion metadata, ready to upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedRecord {
    pub id: String,
    pub payload: String,
    /// RFC 3339 UTC timestamp of wrapping.
    pub ingested_at: String,
    pub window_start: String,
    pub window_end: String,
    pub page_number: i64,
}

/// Per-run state machine. No state is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Authenticating,
    Extracting,
    Persisting,
    Committed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Authenticating => "authenticating",
            RunState::Extracting => "extracting",
            RunState::Persisting => "persisting",
            RunState::Committed => "committed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Committed | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a completed run reports back to its caller.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub resource: String,
    pub table: String,
    pub window_start: String,
    pub window_end: String,
    /// Records extracted and enveloped.
    pub records: u64,
    /// Records written to the target table (0 on dry runs).
    pub committed: u64,
    pub pages: u32,
    pub requests: u32,
    pub rate_limited: u32,
    pub rotation_observed: bool,
    pub new_refresh_token: Option<String>,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
