//! Error taxonomy for a sync run.
//!
//! Every variant is fatal for the run it occurs in. Rate limiting is not an
//! error by itself: the extractor absorbs HTTP 429 responses and only surfaces
//! [`SyncError::RateLimitExhausted`] once the configured retry cap is reached.
//!
//! Display strings include the remote response body verbatim so a failed run
//! can be diagnosed from its output alone.

use std::fmt;
use thiserror::Error;

use crate::extract::ExtractStats;
use crate::models::RunState;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A named secret is absent from the credential store.
    #[error("secret '{name}' not found in credential store")]
    SecretMissing { name: String },

    /// The credential store itself could not be read.
    #[error("credential store error: {0}")]
    CredentialStore(String),

    /// The identity provider rejected the refresh grant, or answered with a
    /// body that carries no access token.
    #[error("token refresh failed (HTTP {status}): {body}")]
    Auth { status: u16, body: String },

    /// Too many consecutive HTTP 429 responses at the same cursor position.
    #[error(
        "rate limit not lifted for {resource} at STARTPOSITION {start_position} after {attempts} attempts"
    )]
    RateLimitExhausted {
        resource: String,
        start_position: u32,
        attempts: u32,
    },

    /// Non-success status from the query endpoint other than 429.
    #[error("query for {resource} failed (HTTP {status}): {body}")]
    Extraction {
        resource: String,
        status: u16,
        body: String,
    },

    /// A 2xx query response whose body does not have the expected shape.
    #[error("unexpected query response for {resource}: {message}")]
    UnexpectedResponse { resource: String, message: String },

    /// A record without a usable natural identifier.
    #[error(
        "{resource} record #{position} on page {page_number} has no usable '{field}' field"
    )]
    MalformedRecord {
        resource: String,
        page_number: u32,
        position: usize,
        field: String,
    },

    /// Schema setup or upsert failed; the enclosing transaction was rolled back.
    #[error("persistence failed: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("invalid time window: {0}")]
    InvalidWindow(String),

    /// Transport-level HTTP failure (connect, TLS, timeout, body read).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SyncError {
    /// Short machine-friendly category, stored in the run history.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::SecretMissing { .. } | SyncError::CredentialStore(_) => "credentials",
            SyncError::Auth { .. } => "auth",
            SyncError::RateLimitExhausted { .. } => "rate_limit_exhausted",
            SyncError::Extraction { .. } | SyncError::UnexpectedResponse { .. } => "extraction",
            SyncError::MalformedRecord { .. } => "malformed_record",
            SyncError::Persistence(_) => "persistence",
            SyncError::InvalidWindow(_) => "invalid_window",
            SyncError::Http(_) => "http",
        }
    }
}

/// A run that ended in [`RunState::Failed`].
///
/// Carries a rotated refresh token when the provider issued one before the
/// failure, so the caller can still surface it, and the work done up to the
/// failure. `committed` is non-zero only in page commit mode.
#[derive(Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: SyncError,
    /// State the run was in when the error occurred.
    pub failed_in: RunState,
    pub new_refresh_token: Option<String>,
    pub stats: ExtractStats,
    /// Records that stayed committed despite the failure.
    pub committed: u64,
}

impl fmt::Debug for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunFailure")
            .field("error", &self.error)
            .field("failed_in", &self.failed_in)
            .field("rotation_observed", &self.new_refresh_token.is_some())
            .field("stats", &self.stats)
            .field("committed", &self.committed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_carries_provider_body() {
        let err = SyncError::Auth {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("HTTP 400"));
        assert!(msg.contains("invalid_grant"));
        assert_eq!(err.kind(), "auth");
    }

    #[test]
    fn extraction_error_names_resource() {
        let err = SyncError::Extraction {
            resource: "Invoice".to_string(),
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "query for Invoice failed (HTTP 500): boom"
        );
        assert_eq!(err.kind(), "extraction");
    }
}
