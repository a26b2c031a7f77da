//! Sync progress reporting.
//!
//! Reports observable progress during `qbo-sync sync`: state transitions of
//! each run, every page pulled from the API, and every rate-limit pause.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::RunState;

/// A single progress event for a sync run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// The run moved to a new state.
    State { resource: String, state: RunState },
    /// A page was extracted. `total` is the running record count.
    PageFetched {
        resource: String,
        page_number: u32,
        records: u64,
        total: u64,
    },
    /// The API answered 429; the same request is re-sent after `wait_secs`.
    RateLimited {
        resource: String,
        start_position: u32,
        attempt: u32,
        wait_secs: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync pipeline.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync invoices  page 3  1,234 records".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::State { resource, state } => {
                format!("sync {}  {}\n", resource, state)
            }
            SyncProgressEvent::PageFetched {
                resource,
                page_number,
                records,
                total,
            } => format!(
                "sync {}  page {}  +{}  {} records\n",
                resource,
                page_number,
                format_number(*records),
                format_number(*total)
            ),
            SyncProgressEvent::RateLimited {
                resource,
                start_position,
                attempt,
                wait_secs,
            } => format!(
                "sync {}  rate limited at position {} (attempt {}), waiting {}s\n",
                resource, start_position, attempt, wait_secs
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &SyncProgressEvent) -> serde_json::Value {
    match event {
        SyncProgressEvent::State { resource, state } => serde_json::json!({
            "event": "state",
            "resource": resource,
            "state": state,
        }),
        SyncProgressEvent::PageFetched {
            resource,
            page_number,
            records,
            total,
        } => serde_json::json!({
            "event": "page",
            "resource": resource,
            "page": page_number,
            "records": records,
            "total": total,
        }),
        SyncProgressEvent::RateLimited {
            resource,
            start_position,
            attempt,
            wait_secs,
        } => serde_json::json!({
            "event": "rate_limited",
            "resource": resource,
            "start_position": start_position,
            "attempt": attempt,
            "wait_secs": wait_secs,
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
