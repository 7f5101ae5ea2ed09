use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use color_eyre::{Result, eyre::eyre};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::repository::AuthSessionRepository;

const SERVICE_NAME: &str = "wechat-agent";

/// Opaque credential storage. Secrets go to the OS keychain when requested
/// (or auto-detected on macOS), otherwise to a JSON file with mode 0600
/// under the config directory. Only non-sensitive metadata ever reaches the
/// database.
pub struct SessionVault {
    backend: String,
    service_name: String,
    store_path: Option<PathBuf>,
}

pub fn secret_fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn default_session_store() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let trimmed = xdg.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join(SERVICE_NAME).join("sessions.json");
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(SERVICE_NAME)
        .join("sessions.json")
}

impl SessionVault {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into().trim().to_ascii_lowercase(),
            service_name: SERVICE_NAME.to_string(),
            store_path: None,
        }
    }

    /// Test helper: file backend rooted at an explicit path.
    pub fn with_store_path(path: PathBuf) -> Self {
        Self {
            backend: "file".to_string(),
            service_name: SERVICE_NAME.to_string(),
            store_path: Some(path),
        }
    }

    fn use_keychain(&self) -> bool {
        match self.backend.as_str() {
            "keychain" => true,
            "file" => false,
            _ => cfg!(target_os = "macos"),
        }
    }

    fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(default_session_store)
    }

    fn account(&self, provider: &str) -> String {
        format!("{}:{provider}", self.service_name)
    }

    pub fn set(&self, provider: &str, secret: &str) -> Result<()> {
        if self.use_keychain() {
            let entry = keyring::Entry::new(&self.service_name, &self.account(provider))
                .map_err(|e| eyre!("keychain entry failed: {e}"))?;
            entry
                .set_password(secret)
                .map_err(|e| eyre!("keychain write failed: {e}"))?;
            return Ok(());
        }
        self.set_file(provider, secret)
    }

    pub fn get(&self, provider: &str) -> Option<String> {
        if self.use_keychain() {
            let entry = keyring::Entry::new(&self.service_name, &self.account(provider)).ok()?;
            return match entry.get_password() {
                Ok(secret) if !secret.trim().is_empty() => Some(secret),
                Ok(_) => None,
                Err(keyring::Error::NoEntry) => None,
                Err(err) => {
                    warn!("keychain lookup failed for {provider}: {err}");
                    None
                }
            };
        }
        self.get_file(provider)
    }

    pub fn delete(&self, provider: &str) -> Result<()> {
        if self.use_keychain() {
            if let Ok(entry) = keyring::Entry::new(&self.service_name, &self.account(provider)) {
                match entry.delete_credential() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(err) => warn!("keychain delete failed for {provider}: {err}"),
                }
            }
            return Ok(());
        }
        self.delete_file(provider)
    }

    fn load_file(&self) -> HashMap<String, String> {
        let path = self.store_path();
        let Ok(content) = std::fs::read_to_string(&path) else {
            return HashMap::new();
        };
        serde_json::from_str::<HashMap<String, String>>(&content).unwrap_or_default()
    }

    fn write_file(&self, payload: &HashMap<String, String>) -> Result<()> {
        let path = self.store_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(payload)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn set_file(&self, provider: &str, secret: &str) -> Result<()> {
        let mut payload = self.load_file();
        payload.insert(provider.to_string(), secret.to_string());
        self.write_file(&payload)
    }

    fn get_file(&self, provider: &str) -> Option<String> {
        let payload = self.load_file();
        payload
            .get(provider)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn delete_file(&self, provider: &str) -> Result<()> {
        let mut payload = self.load_file();
        if payload.remove(provider).is_some() {
            self.write_file(&payload)?;
        }
        Ok(())
    }
}

/// Vault plus the session-metadata table: expiry is checked against the
/// metadata row before the secret is handed out.
pub struct VaultSessions {
    vault: SessionVault,
    auth_repo: AuthSessionRepository,
}

impl VaultSessions {
    pub fn new(vault: SessionVault, auth_repo: AuthSessionRepository) -> Self {
        Self { vault, auth_repo }
    }

    pub async fn store(
        &self,
        provider: &str,
        secret: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.vault.set(provider, secret)?;
        self.auth_repo
            .upsert(provider, &secret_fingerprint(secret), expires_at)
            .await?;
        Ok(())
    }

    /// The secret, unless the metadata row says the session has expired.
    /// The secret is held in memory only for the duration of the caller's
    /// use.
    pub async fn get_active(&self, provider: &str) -> Result<Option<String>> {
        if let Some(entry) = self.auth_repo.get(provider).await? {
            if entry.expires_at.is_some_and(|at| at <= Utc::now()) {
                return Ok(None);
            }
        }
        Ok(self.vault.get(provider))
    }

    pub async fn forget(&self, provider: &str) -> Result<()> {
        self.vault.delete(provider)?;
        self.auth_repo.delete(provider).await?;
        Ok(())
    }
}
