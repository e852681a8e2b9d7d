//! Credential lookup behind the [`PasswordSource`] boundary.
//!
//! The pool asks for a password when it creates a session; where that
//! password comes from (keyring, environment, prompt, ...) is the embedder's
//! business. `CredentialStore` is the built-in non-interactive source.

use anyhow::Result;
use async_trait::async_trait;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const ENV_PASSWORD: &str = "MAILSYNC_PASSWORD";
const KEYRING_SERVICE: &str = "mailsync";

/// Supplies a password for an account.
///
/// `prior_error` carries the server's rejection text when a previously
/// supplied password failed; interactive sources should display it before
/// prompting again.
#[async_trait]
pub trait PasswordSource: Send + Sync {
    async fn password(&self, account: &str, prior_error: Option<&str>) -> Result<String>;
}

/// Non-interactive credential lookup: environment variable, then keyring,
/// then a permission-restricted file under the config directory.
pub struct CredentialStore {
    config_dir: PathBuf,
}

impl CredentialStore {
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailsync");
        Self { config_dir }
    }

    fn password_file(&self, account: &str) -> PathBuf {
        let safe = account.replace(['@', '.', '/', '\\', ':'], "_");
        self.config_dir.join(format!(".password_{}", safe))
    }

    fn env_password() -> Option<String> {
        env::var(ENV_PASSWORD).ok()
    }

    fn keyring_get(&self, account: &str) -> Option<String> {
        let key = format!("imap:{}", account);
        let entry = keyring::Entry::new(KEYRING_SERVICE, &key).ok()?;
        entry.get_password().ok()
    }

    fn file_get(&self, account: &str) -> Option<String> {
        fs::read_to_string(self.password_file(account))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Store a password in the keyring, falling back to a 0600 file.
    pub fn set_password(&self, account: &str, password: &str) -> Result<()> {
        let key = format!("imap:{}", account);
        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &key)
            && entry.set_password(password).is_ok()
            && self.keyring_get(account).is_some()
        {
            return Ok(());
        }

        self.file_set(account, password)
    }

    fn file_set(&self, account: &str, password: &str) -> Result<()> {
        let path = self.password_file(account);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Create with restricted permissions atomically to avoid TOCTOU
        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.write_all(password.as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, password)?;
        }

        Ok(())
    }

    pub fn has_credentials(&self, account: &str) -> bool {
        Self::env_password().is_some()
            || self.keyring_get(account).is_some()
            || self.file_get(account).is_some()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PasswordSource for CredentialStore {
    async fn password(&self, account: &str, prior_error: Option<&str>) -> Result<String> {
        // A stored password that the server already rejected will not get
        // better by re-reading it; a non-interactive store cannot prompt.
        if let Some(reason) = prior_error {
            anyhow::bail!(
                "Stored password for {} was rejected ({}); update it and retry.",
                account,
                reason
            );
        }

        if let Some(pwd) = Self::env_password() {
            return Ok(pwd);
        }
        if let Some(pwd) = self.keyring_get(account) {
            return Ok(pwd);
        }
        if let Some(pwd) = self.file_get(account) {
            return Ok(pwd);
        }

        anyhow::bail!(
            "Password for {} not found. Set {} or store one in the keyring.",
            account,
            ENV_PASSWORD
        )
    }
}
