//! OAuth2 refresh-token exchange.
//!
//! Each run starts by trading the stored refresh token for a fresh access
//! token at the identity provider:
//!
//! ```text
//! POST {auth.token_url}
//! Authorization: Basic base64(client_id:client_secret)
//! Content-Type: application/x-www-form-urlencoded
//!
//! grant_type=refresh_token&refresh_token=<token>
//! ```
//!
//! The provider may answer with a different refresh token than the one
//! supplied (rotation). The grant reports that explicitly; the caller is
//! responsible for getting the new value back into the credential store.
//!
//! A non-success status is fatal and never retried.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;

use crate::config::AuthConfig;
use crate::error::SyncError;
use crate::models::{fingerprint, AccessToken, RefreshCredential, TokenGrant};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct TokenManager {
    client: reqwest::Client,
    token_url: String,
}

impl TokenManager {
    pub fn new(config: &AuthConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            token_url: config.token_url.clone(),
        })
    }

    /// Exchange `credential` for an access token.
    pub async fn acquire_access_token(
        &self,
        credential: &RefreshCredential,
    ) -> Result<TokenGrant, SyncError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh_token.as_str()),
        ];

        let resp = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .header(
                "Authorization",
                basic_authorization(&credential.client_id, &credential.client_secret),
            )
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SyncError::Auth {
                status: status.as_u16(),
                body,
            });
        }

        let grant = interpret_grant(&body, &credential.refresh_token).map_err(|_| {
            SyncError::Auth {
                status: status.as_u16(),
                body,
            }
        })?;

        tracing::info!(
            issued_by = %grant.access_token.issued_by,
            rotated = grant.rotation_observed,
            "access token acquired"
        );
        if grant.rotation_observed {
            tracing::warn!(
                "identity provider rotated the refresh token; update the stored credential"
            );
        }
        Ok(grant)
    }
}

/// `Basic base64(client_id:client_secret)`.
pub fn basic_authorization(client_id: &str, client_secret: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", client_id, client_secret))
    )
}

/// Parse a successful token response body and compare the returned refresh
/// token against the one that was supplied.
pub fn interpret_grant(body: &str, supplied_refresh_token: &str) -> serde_json::Result<TokenGrant> {
    let parsed: TokenResponse = serde_json::from_str(body)?;
    let new_refresh_token = parsed
        .refresh_token
        .filter(|t| !t.is_empty() && t != supplied_refresh_token);

    Ok(TokenGrant {
        access_token: AccessToken {
            token: parsed.access_token,
            issued_by: fingerprint(supplied_refresh_token),
        },
        rotation_observed: new_refresh_token.is_some(),
        new_refresh_token,
    })
}
