//! Secret storage behind the release gate.
//!
//! Only the gate reads from the vault. Secret values never reach logs or
//! the audit ledger: [`SecretValue`] redacts itself in `Debug` output.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Vault error types.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The requested secret does not exist.
    #[error("secret not found: {0}")]
    NotFound(String),
    /// A storage or access error occurred.
    #[error("vault access error: {0}")]
    AccessError(String),
}

/// Opaque secret value that never appears in logs.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value. Use only when handing it to the protected action.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Capability that returns a secret by name, or nothing.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store a secret by name. Overwrites any existing value.
    async fn store_secret(&self, name: &str, value: SecretValue) -> Result<(), VaultError>;

    /// Retrieve a secret by name.
    async fn get_secret(&self, name: &str) -> Result<SecretValue, VaultError>;
}

/// In-memory vault, optionally seeded from a dotenv-style file.
#[derive(Default)]
pub struct InMemoryVault {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl InMemoryVault {
    /// Create an empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `KEY=value` pairs from a private (0600) secrets file.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AccessError`] if the file is missing, readable
    /// by group or others, or malformed.
    pub fn from_env_file(path: &Path) -> Result<Self, VaultError> {
        if !path.exists() {
            return Err(VaultError::AccessError(format!(
                "secrets file does not exist: {}",
                path.display()
            )));
        }
        validate_private_permissions(path)?;

        let mut secrets = HashMap::new();
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            VaultError::AccessError(format!("failed to read {}: {e}", path.display()))
        })?;
        for item in iter {
            let (key, value) = item.map_err(|e| {
                VaultError::AccessError(format!(
                    "failed to parse entry in secrets file {}: {e}",
                    path.display()
                ))
            })?;
            secrets.insert(key, SecretValue::new(value));
        }
        debug!(count = secrets.len(), path = %path.display(), "secrets loaded");

        Ok(Self {
            secrets: RwLock::new(secrets),
        })
    }
}

#[async_trait]
impl SecretStore for InMemoryVault {
    async fn store_secret(&self, name: &str, value: SecretValue) -> Result<(), VaultError> {
        self.secrets.write().await.insert(name.to_owned(), value);
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<SecretValue, VaultError> {
        self.secrets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(name.to_owned()))
    }
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| {
        VaultError::AccessError(format!("failed to inspect {}: {e}", path.display()))
    })?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(VaultError::AccessError(format!(
            "secrets file {} must be 0600, found {:o}",
            path.display(),
            mode
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> Result<(), VaultError> {
    Ok(())
}
