//! Configuration for the mail mirror
//!
//! OAuth credentials are loaded from (in order of priority):
//! 1. Compile-time embedded credentials (for release builds)
//! 2. `google-credentials.json` in the config directory (Google Cloud Console format)
//! 3. Runtime environment variables
//!
//! Sync tuning lives in `settings.json` next to the credentials. Every field
//! is optional; command-line flags override what the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::DATABASE_FILE_NAME;
use crate::sync::{RetryPolicy, default_workers};

const CREDENTIALS_FILE: &str = "google-credentials.json";
const SETTINGS_FILE: &str = "settings.json";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file (installed or web app)
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<ClientSection>,
    web: Option<ClientSection>,
}

#[derive(Deserialize)]
struct ClientSection {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let file: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(file);
        }

        Self::from_env().context(
            "No Gmail credentials found. Place google-credentials.json in the config \
             directory or set GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
        )
    }

    /// Credentials embedded with
    /// `GOOGLE_CLIENT_ID=.. GOOGLE_CLIENT_SECRET=.. cargo build --release`
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;
        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }
        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(file)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(file)
    }

    fn from_credential_file(file: GoogleCredentialFile) -> Result<Self> {
        let section = file
            .installed
            .or(file.web)
            .context("Credentials file missing 'installed' or 'web' section")?;
        Ok(Self {
            client_id: section.client_id,
            client_secret: section.client_secret,
        })
    }

    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;
        Ok(Self {
            client_id,
            client_secret,
        })
    }
}

/// Sync tuning from `settings.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Directory holding the message database
    pub data_dir: Option<PathBuf>,
    /// Concurrent fetch workers; available parallelism when unset
    pub workers: Option<usize>,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
    /// Attempts per API call, including the first
    pub max_attempts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            workers: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_attempts: RetryPolicy::api().max_attempts,
        }
    }
}

impl SyncSettings {
    /// Load `settings.json` from the config directory, or defaults if absent
    pub fn load() -> Result<Self> {
        if config::config_exists(SETTINGS_FILE) {
            config::load_json(SETTINGS_FILE)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => config::default_data_dir().context("Could not determine data directory"),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DATABASE_FILE_NAME))
    }

    pub fn workers(&self) -> usize {
        self.workers.filter(|&n| n > 0).unwrap_or_else(default_workers)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::api().with_max_attempts(self.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_installed_credentials() {
        let json = r#"{
            "installed": {
                "client_id": "test-client-id.apps.googleusercontent.com",
                "client_secret": "test-secret",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;

        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "test-client-id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "test-secret");
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "web-id");
    }

    #[test]
    fn test_credentials_without_client_section() {
        assert!(GmailCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: SyncSettings = serde_json::from_str(r#"{ "workers": 3 }"#).unwrap();
        assert_eq!(settings.workers(), 3);
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.retry_policy().max_attempts, 5);
        assert_eq!(settings.data_dir, None);
    }

    #[test]
    fn test_zero_workers_falls_back_to_default() {
        let settings = SyncSettings {
            workers: Some(0),
            ..SyncSettings::default()
        };
        assert_eq!(settings.workers(), default_workers());
    }

    #[test]
    fn test_settings_file_and_database_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            format!(
                r#"{{ "data_dir": {:?}, "max_attempts": 2 }}"#,
                dir.path().display().to_string()
            ),
        )
        .unwrap();

        let settings = SyncSettings::from_file(&path).unwrap();
        assert_eq!(settings.retry_policy().max_attempts, 2);
        assert_eq!(
            settings.database_path().unwrap(),
            dir.path().join(DATABASE_FILE_NAME)
        );
    }
}
