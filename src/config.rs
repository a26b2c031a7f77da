use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::models::ResourceDescriptor;

/// Largest page the QuickBooks query API will return.
pub const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub raw_path: Option<PathBuf>,
}

impl DbConfig {
    /// File backing the `raw` namespace. Defaults to `raw.sqlite` next to
    /// the control database.
    pub fn raw_path(&self) -> PathBuf {
        match &self.raw_path {
            Some(p) => p.clone(),
            None => self
                .path
                .parent()
                .map(|dir| dir.join("raw.sqlite"))
                .unwrap_or_else(|| PathBuf::from("raw.sqlite")),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_token_url() -> String {
    "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_size: default_page_size(),
            rate_limit_backoff_secs: default_backoff_secs(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            utc_offset: default_utc_offset(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ApiConfig {
    /// The configured window offset. Only valid after [`load_config`] has
    /// accepted the value; falls back to UTC otherwise.
    pub fn offset(&self) -> FixedOffset {
        parse_utc_offset(&self.utc_offset).unwrap_or_else(|_| Utc.fix())
    }
}

fn default_base_url() -> String {
    "https://sandbox-quickbooks.api.intuit.com".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_backoff_secs() -> u64 {
    5
}
fn default_max_rate_limit_retries() -> u32 {
    12
}
fn default_utc_offset() -> String {
    "-05:00".to_string()
}

/// How extracted records are grouped into transactions.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// One transaction for the whole window: all or nothing.
    #[default]
    Window,
    /// One transaction per extracted page.
    Page,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub commit: CommitMode,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_provider")]
    pub provider: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_client_id_key")]
    pub client_id: String,
    #[serde(default = "default_client_secret_key")]
    pub client_secret: String,
    #[serde(default = "default_refresh_token_key")]
    pub refresh_token: String,
    #[serde(default = "default_realm_id_key")]
    pub realm_id: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            provider: default_credentials_provider(),
            path: None,
            client_id: default_client_id_key(),
            client_secret: default_client_secret_key(),
            refresh_token: default_refresh_token_key(),
            realm_id: default_realm_id_key(),
        }
    }
}

fn default_credentials_provider() -> String {
    "env".to_string()
}
fn default_client_id_key() -> String {
    "QBO_CLIENT_ID".to_string()
}
fn default_client_secret_key() -> String {
    "QBO_CLIENT_SECRET".to_string()
}
fn default_refresh_token_key() -> String {
    "QBO_REFRESH_TOKEN".to_string()
}
fn default_realm_id_key() -> String {
    "QBO_REALM_ID".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourceConfig {
    pub type_name: String,
    pub table: String,
    #[serde(default)]
    pub query_key: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_id_field() -> String {
    "Id".to_string()
}

impl Config {
    /// Resource descriptors in name order. Falls back to the built-in
    /// invoice and item descriptors when none are configured.
    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        if self.resources.is_empty() {
            return ResourceDescriptor::builtin();
        }
        self.resources
            .iter()
            .map(|(name, rc)| ResourceDescriptor {
                name: name.clone(),
                type_name: rc.type_name.clone(),
                table: rc.table.clone(),
                query_key: rc.query_key.clone().unwrap_or_else(|| rc.type_name.clone()),
                id_field: rc.id_field.clone(),
            })
            .collect()
    }

    /// Look up a resource descriptor by its configured name.
    pub fn resource(&self, name: &str) -> Result<ResourceDescriptor> {
        let all = self.resources();
        let names: Vec<&str> = all.iter().map(|r| r.name.as_str()).collect();
        let available = names.join(", ");
        all.iter()
            .find(|r| r.name == name)
            .cloned()
            .with_context(|| format!("Unknown resource: '{}'. Available: {}", name, available))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check a parsed config for values the pipeline cannot work with.
pub fn validate(config: &Config) -> Result<()> {
    // Validate api
    if config.api.page_size == 0 || config.api.page_size > MAX_PAGE_SIZE {
        anyhow::bail!("api.page_size must be in 1..={}", MAX_PAGE_SIZE);
    }
    parse_utc_offset(&config.api.utc_offset)
        .with_context(|| format!("api.utc_offset '{}' is invalid", config.api.utc_offset))?;
    if config.api.base_url.trim().is_empty() {
        anyhow::bail!("api.base_url must not be empty");
    }
    if config.auth.token_url.trim().is_empty() {
        anyhow::bail!("auth.token_url must not be empty");
    }

    // Validate credentials
    match config.credentials.provider.as_str() {
        "env" => {}
        "file" => {
            if config.credentials.path.is_none() {
                anyhow::bail!("credentials.path must be set when provider is 'file'");
            }
        }
        other => anyhow::bail!(
            "Unknown credentials provider: '{}'. Must be env or file.",
            other
        ),
    }

    // Validate resources
    for resource in config.resources() {
        for (field, value) in [
            ("type_name", &resource.type_name),
            ("query_key", &resource.query_key),
            ("table", &resource.table),
        ] {
            if !is_sql_identifier(value) {
                anyhow::bail!(
                    "resources.{}.{} '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                    resource.name,
                    field,
                    value
                );
            }
        }
        if resource.id_field.is_empty() {
            anyhow::bail!("resources.{}.id_field must not be empty", resource.name);
        }
    }

    Ok(())
}

/// Real-world offsets range from UTC-12:00 to UTC+14:00.
const MAX_UTC_OFFSET_SECS: i32 = 14 * 3600;

/// Parse a `±HH:MM` offset such as `-05:00`.
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let offset = FixedOffset::from_str(s.trim())
        .with_context(|| format!("offset {:?} must be formatted as ±HH:MM", s))?;
    if offset.local_minus_utc().abs() > MAX_UTC_OFFSET_SECS {
        anyhow::bail!("offset {} out of range", s);
    }
    Ok(offset)
}

/// `true` when `s` can be spliced into SQL or a query as a bare identifier.
pub fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
