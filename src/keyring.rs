//! Credential storage.
//!
//! Tokens live behind the [`SecretStore`] trait: the OS keyring in normal
//! operation, a plain file under the config dir when `BOTSTER_ENV=test`
//! (CI boxes rarely have an unlockable keychain). Consumers only see
//! [`Credentials`].

use anyhow::{Context, Result};

use crate::env;

/// Keyring service name.
const SERVICE: &str = "botster";
/// Keyring entry for the consolidated credentials blob.
const ACCOUNT: &str = "credentials";

/// Opaque secret storage.
pub trait SecretStore {
    /// Read the stored secret, if any.
    fn get(&self) -> Result<Option<String>>;
    /// Write the secret.
    fn set(&self, value: &str) -> Result<()>;
    /// Remove the secret. Absence is not an error.
    fn delete(&self) -> Result<()>;
}

/// OS keyring backend.
pub struct KeyringStore;

impl SecretStore for KeyringStore {
    fn get(&self) -> Result<Option<String>> {
        let entry = keyring::Entry::new(SERVICE, ACCOUNT).context("open keyring entry")?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("read keyring entry"),
        }
    }

    fn set(&self, value: &str) -> Result<()> {
        let entry = keyring::Entry::new(SERVICE, ACCOUNT).context("open keyring entry")?;
        entry.set_password(value).context("write keyring entry")
    }

    fn delete(&self) -> Result<()> {
        let entry = keyring::Entry::new(SERVICE, ACCOUNT).context("open keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("delete keyring entry"),
        }
    }
}

/// Plain-file backend for test environments.
pub struct FileStore {
    path: std::path::PathBuf,
}

impl FileStore {
    /// Store under the config dir.
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: crate::config::Config::config_dir()?.join("credentials.json"),
        })
    }
}

impl SecretStore for FileStore {
    fn get(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&self.path)?))
    }

    fn set(&self, value: &str) -> Result<()> {
        std::fs::write(&self.path, value)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Pick the backend for the current environment.
fn default_store() -> Result<Box<dyn SecretStore>> {
    if env::should_skip_keyring() {
        Ok(Box::new(FileStore::new()?))
    } else {
        Ok(Box::new(KeyringStore))
    }
}

/// The consolidated credentials blob stored behind the secret store.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    api_token: Option<String>,
}

impl Credentials {
    /// Load from the environment-appropriate store.
    pub fn load() -> Result<Self> {
        let store = default_store()?;
        match store.get()? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    /// Persist to the environment-appropriate store.
    pub fn save(&self) -> Result<()> {
        let store = default_store()?;
        store.set(&serde_json::to_string(self)?)
    }

    /// Remove all stored credentials.
    pub fn clear() -> Result<()> {
        default_store()?.delete()
    }

    /// The device token, if stored.
    #[must_use]
    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    /// Replace the device token.
    pub fn set_api_token(&mut self, token: String) {
        self.api_token = Some(token);
    }

    /// Drop the device token.
    pub fn clear_api_token(&mut self) {
        self.api_token = None;
    }
}
