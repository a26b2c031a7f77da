//! Wrapping raw payloads into persistence-ready records.
//!
//! The payload is the object's JSON text exactly as the API returned it:
//! same key order, same number literals, no filtering. Downstream models
//! read from it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::SyncError;
use crate::models::{ExtractedRecord, ResourceDescriptor, TimeWindow};

/// Wrap one raw object, stamping `ingested_at` with the current time.
pub fn wrap(
    raw: &RawValue,
    resource: &ResourceDescriptor,
    window: &TimeWindow,
    page_number: u32,
    position: usize,
) -> Result<ExtractedRecord, SyncError> {
    wrap_at(raw, resource, window, page_number, position, Utc::now())
}

/// Wrap one raw object with an explicit ingestion time.
///
/// `position` is the object's index within its page and only feeds the error
/// message when the natural identifier is missing.
pub fn wrap_at(
    raw: &RawValue,
    resource: &ResourceDescriptor,
    window: &TimeWindow,
    page_number: u32,
    position: usize,
    ingested_at: DateTime<Utc>,
) -> Result<ExtractedRecord, SyncError> {
    let id = natural_id(raw, &resource.id_field).ok_or_else(|| SyncError::MalformedRecord {
        resource: resource.type_name.clone(),
        page_number,
        position,
        field: resource.id_field.clone(),
    })?;

    Ok(ExtractedRecord {
        id,
        payload: raw.get().to_string(),
        ingested_at: ingested_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        window_start: window.start_label(),
        window_end: window.end_label(),
        page_number: page_number as i64,
    })
}

/// Wrap every object of a page, failing on the first malformed one.
pub fn wrap_page(
    records: &[Box<RawValue>],
    resource: &ResourceDescriptor,
    window: &TimeWindow,
    page_number: u32,
) -> Result<Vec<ExtractedRecord>, SyncError> {
    let now = Utc::now();
    records
        .iter()
        .enumerate()
        .map(|(i, raw)| wrap_at(raw, resource, window, page_number, i, now))
        .collect()
}

/// Identifiers arrive as JSON strings; integers are accepted and rendered
/// in decimal. Anything else, including an empty string, has no identity.
///
/// Only the top level is split; the id value alone is decoded.
fn natural_id(raw: &RawValue, field: &str) -> Option<String> {
    let fields: HashMap<String, &RawValue> = serde_json::from_str(raw.get()).ok()?;
    match serde_json::from_str::<Value>(fields.get(field)?.get()).ok()? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}
