//! Paginated extraction from the QuickBooks query endpoint.
//!
//! For one resource type and one [`TimeWindow`], the extractor issues
//!
//! ```text
//! POST {api.base_url}/v3/company/{realm_id}/query
//! Authorization: Bearer <access token>
//!
//! SELECT * FROM <Type> WHERE MetaData.LastUpdatedTime >= '<start>T00:00:00-05:00'
//!   AND MetaData.LastUpdatedTime <= '<end>T23:59:59-05:00'
//!   STARTPOSITION <n> MAXRESULTS <page_size>
//! ```
//!
//! and walks the cursor forward until the window is exhausted.
//!
//! # Termination
//!
//! | Response | Effect |
//! |----------|--------|
//! | 2xx, no records (or no key) | sequence ends, nothing emitted |
//! | 2xx, `0 < n < page_size` | page emitted, sequence ends |
//! | 2xx, `n == page_size` | page emitted, `STARTPOSITION += n` |
//! | 429 | sleep, re-issue the same request |
//! | other | [`SyncError::Extraction`] |
//!
//! Consecutive 429s at one cursor position are capped by
//! `api.max_rate_limit_retries`; the cap surfaces as
//! [`SyncError::RateLimitExhausted`].

use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::ApiConfig;
use crate::error::SyncError;
use crate::models::{format_bound, AccessToken, RawPage, ResourceDescriptor, TimeWindow};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};

/// Counters describing the HTTP work done by one [`PageCursor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Requests sent, including rate-limited ones.
    pub requests: u32,
    /// Responses with HTTP 429.
    pub rate_limited: u32,
    /// Pages emitted.
    pub pages: u32,
    /// Records emitted.
    pub records: u64,
}

pub struct PaginatedExtractor {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    backoff: Duration,
    max_rate_limit_retries: u32,
}

impl PaginatedExtractor {
    pub fn new(config: &ApiConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size.max(1),
            backoff: Duration::from_secs(config.rate_limit_backoff_secs),
            max_rate_limit_retries: config.max_rate_limit_retries,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Start a fresh page sequence. The cursor is single-use: once it has
    /// returned `None` it stays exhausted.
    pub fn pages<'a>(
        &'a self,
        resource: &'a ResourceDescriptor,
        window: &'a TimeWindow,
        token: &'a AccessToken,
        realm_id: &'a str,
        progress: &'a dyn SyncProgressReporter,
    ) -> PageCursor<'a> {
        PageCursor {
            extractor: self,
            resource,
            window,
            token,
            url: format!("{}/v3/company/{}/query", self.base_url, realm_id),
            progress,
            start_position: 1,
            finished: false,
            stats: ExtractStats::default(),
        }
    }
}

/// Lazy, finite, non-restartable sequence of [`RawPage`]s.
pub struct PageCursor<'a> {
    extractor: &'a PaginatedExtractor,
    resource: &'a ResourceDescriptor,
    window: &'a TimeWindow,
    token: &'a AccessToken,
    url: String,
    progress: &'a dyn SyncProgressReporter,
    start_position: u32,
    finished: bool,
    stats: ExtractStats,
}

impl PageCursor<'_> {
    pub fn stats(&self) -> ExtractStats {
        self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fetch the next page, or `None` once the window is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<RawPage>, SyncError> {
        if self.finished {
            return Ok(None);
        }
        let page_size = self.extractor.page_size;
        let start_position = self.start_position;
        let query = build_query(&self.resource.type_name, self.window, start_position, page_size);

        let result = self.fetch(&query, start_position).await;
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        if records.is_empty() {
            tracing::debug!(resource = %self.resource.type_name, start_position, "no more records");
            self.finished = true;
            return Ok(None);
        }

        let count = records.len() as u32;
        if count < page_size {
            self.finished = true;
        } else {
            self.start_position += count;
        }

        let page = RawPage {
            records,
            start_position,
            page_size,
        };
        self.stats.pages += 1;
        self.stats.records += count as u64;
        tracing::info!(
            resource = %self.resource.type_name,
            page = page.page_number(),
            records = count,
            start_position,
            "page extracted"
        );
        self.progress.report(SyncProgressEvent::PageFetched {
            resource: self.resource.name.clone(),
            page_number: page.page_number(),
            records: count as u64,
            total: self.stats.records,
        });
        Ok(Some(page))
    }

    /// Send one query, absorbing rate-limit responses at this cursor position.
    async fn fetch(
        &mut self,
        query: &str,
        start_position: u32,
    ) -> Result<Vec<Box<RawValue>>, SyncError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.stats.requests += 1;
            let resp = self
                .extractor
                .client
                .post(&self.url)
                .bearer_auth(&self.token.token)
                .header("Accept", "application/json")
                .header("Content-Type", "application/text")
                .body(query.to_string())
                .send()
                .await?;

            let status = resp.status();
            if status.as_u16() == 429 {
                self.stats.rate_limited += 1;
                if attempts > self.extractor.max_rate_limit_retries {
                    return Err(SyncError::RateLimitExhausted {
                        resource: self.resource.type_name.clone(),
                        start_position,
                        attempts,
                    });
                }
                let wait = self.extractor.backoff;
                tracing::warn!(
                    resource = %self.resource.type_name,
                    start_position,
                    attempt = attempts,
                    "rate limited; waiting {}s",
                    wait.as_secs()
                );
                self.progress.report(SyncProgressEvent::RateLimited {
                    resource: self.resource.name.clone(),
                    start_position,
                    attempt: attempts,
                    wait_secs: wait.as_secs(),
                });
                tokio::time::sleep(wait).await;
                continue;
            }

            let body = resp.text().await?;
            if !status.is_success() {
                return Err(SyncError::Extraction {
                    resource: self.resource.type_name.clone(),
                    status: status.as_u16(),
                    body,
                });
            }

            return parse_query_response(&body, &self.resource.query_key).map_err(|message| {
                SyncError::UnexpectedResponse {
                    resource: self.resource.type_name.clone(),
                    message,
                }
            });
        }
    }
}

/// Build the query text for one page.
pub fn build_query(
    type_name: &str,
    window: &TimeWindow,
    start_position: u32,
    page_size: u32,
) -> String {
    format!(
        "SELECT * FROM {} WHERE MetaData.LastUpdatedTime >= '{}' AND MetaData.LastUpdatedTime <= '{}' STARTPOSITION {} MAXRESULTS {}",
        type_name,
        format_bound(&window.lower_bound()),
        format_bound(&window.upper_bound()),
        start_position,
        page_size
    )
}

/// Body of a query response. Only `QueryResponse` is read; each entry is
/// kept as raw JSON text so records reach the envelope byte for byte.
#[derive(Deserialize)]
struct QueryBody {
    #[serde(rename = "QueryResponse", default)]
    query_response: Option<HashMap<String, Box<RawValue>>>,
}

/// Pull the record array out of `{"QueryResponse": {"<key>": [...]}}`.
///
/// A missing `QueryResponse` or a missing key means zero results.
pub fn parse_query_response(body: &str, key: &str) -> Result<Vec<Box<RawValue>>, String> {
    let parsed: QueryBody =
        serde_json::from_str(body).map_err(|e| format!("body is not a query response: {}", e))?;

    let records = match parsed.query_response.and_then(|mut qr| qr.remove(key)) {
        Some(raw) if raw.get() != "null" => raw,
        _ => return Ok(Vec::new()),
    };

    serde_json::from_str(records.get())
        .map_err(|_| format!("QueryResponse.{} is not an array", key))
}
