//! Credential store backends.
//!
//! The pipeline only needs one operation from secret storage: look up a value
//! by name. [`CredentialStore`] captures that contract; a missing name is a
//! fatal [`SyncError::SecretMissing`].
//!
//! | Store | Source |
//! |-------|--------|
//! | [`EnvCredentialStore`] | Process environment variables |
//! | [`FileCredentialStore`] | A flat TOML file of `NAME = "value"` pairs |
//! | [`StaticCredentialStore`] | An in-memory map (embedding, tests) |
//! | [`OverlayCredentialStore`] | Another store plus in-process overrides |
//!
//! Writing a rotated refresh token back to durable storage is left to the
//! operator; [`OverlayCredentialStore`] only carries it forward for later
//! runs in the same process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::config::CredentialsConfig;
use crate::error::SyncError;
use crate::models::RefreshCredential;

pub trait CredentialStore: Send + Sync {
    /// Return the secret stored under `name`.
    fn get_secret_value(&self, name: &str) -> Result<String, SyncError>;
}

/// Reads secrets from environment variables.
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn get_secret_value(&self, name: &str) -> Result<String, SyncError> {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => Ok(v),
            _ => Err(SyncError::SecretMissing {
                name: name.to_string(),
            }),
        }
    }
}

/// Reads secrets from a TOML file with string values at the top level.
pub struct FileCredentialStore {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl FileCredentialStore {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::CredentialStore(format!("failed to read {}: {}", path.display(), e))
        })?;
        let values: HashMap<String, String> = toml::from_str(&content).map_err(|e| {
            SyncError::CredentialStore(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get_secret_value(&self, name: &str) -> Result<String, SyncError> {
        self.values
            .get(name)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| SyncError::SecretMissing {
                name: name.to_string(),
            })
    }
}

/// Fixed in-memory secrets.
#[derive(Default)]
pub struct StaticCredentialStore {
    values: HashMap<String, String>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

impl CredentialStore for StaticCredentialStore {
    fn get_secret_value(&self, name: &str) -> Result<String, SyncError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::SecretMissing {
                name: name.to_string(),
            })
    }
}

/// Wraps a store and lets later lookups see values set during this process.
pub struct OverlayCredentialStore<'a> {
    inner: &'a dyn CredentialStore,
    overrides: Mutex<HashMap<String, String>>,
}

impl<'a> OverlayCredentialStore<'a> {
    pub fn new(inner: &'a dyn CredentialStore) -> Self {
        Self {
            inner,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, name: &str, value: &str) {
        self.overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.to_string());
    }
}

impl CredentialStore for OverlayCredentialStore<'_> {
    fn get_secret_value(&self, name: &str) -> Result<String, SyncError> {
        let overridden = self
            .overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        match overridden {
            Some(v) => Ok(v),
            None => self.inner.get_secret_value(name),
        }
    }
}

/// Build the store selected by `[credentials].provider`.
pub fn open_store(config: &CredentialsConfig) -> Result<Box<dyn CredentialStore>, SyncError> {
    match config.provider.as_str() {
        "env" => Ok(Box::new(EnvCredentialStore)),
        "file" => {
            let path = config.path.as_ref().ok_or_else(|| {
                SyncError::CredentialStore("credentials.path is not set".to_string())
            })?;
            Ok(Box::new(FileCredentialStore::load(path)?))
        }
        other => Err(SyncError::CredentialStore(format!(
            "unknown provider '{}'",
            other
        ))),
    }
}

/// Resolve the refresh credential using the configured secret names.
pub fn resolve_refresh_credential(
    store: &dyn CredentialStore,
    names: &CredentialsConfig,
) -> Result<RefreshCredential, SyncError> {
    Ok(RefreshCredential {
        client_id: store.get_secret_value(&names.client_id)?,
        client_secret: store.get_secret_value(&names.client_secret)?,
        refresh_token: store.get_secret_value(&names.refresh_token)?,
    })
}
