//! Client configuration.
//!
//! Lives in `.deploy/config.toml` under the project root. `DEPLOY_URL` and
//! `DEPLOY_TOKEN` (from the environment or a `.env` file) override it.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Agent base URL, e.g. `https://example.com:9870`
    #[serde(default)]
    pub url: String,

    /// Shared bearer token
    #[serde(default)]
    pub token: String,

    /// Sent as `x-client-id`
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles per attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Client-side throttle, kept below the agent's limit (0 disables)
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,

    /// zstd-compress upload bodies
    #[serde(default = "default_compression")]
    pub compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Extra ignore patterns on top of `.deployignore` and `.gitignore`
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Snapshot local files before a pull overwrites them
    #[serde(default = "default_backups")]
    pub backups: bool,

    #[serde(default = "default_retention")]
    pub retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "deploy-client".to_string())
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_requests_per_minute() -> usize {
    100
}

fn default_compression() -> bool {
    true
}

fn default_backups() -> bool {
    true
}

fn default_retention() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            client_id: default_client_id(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            requests_per_minute: default_requests_per_minute(),
            compression: default_compression(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            backups: default_backups(),
            retention: default_retention(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// `<root>/.deploy/config.toml`
    pub fn path_for(root: &Path) -> PathBuf {
        root.join(deploy_core::STATE_DIR).join(CONFIG_FILE)
    }

    /// Load the project's config; a missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path_for(root);
        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = Self::path_for(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load `.env` (if any) and apply `DEPLOY_URL` / `DEPLOY_TOKEN`.
    pub fn apply_env_overrides(&mut self) {
        let _ = dotenvy::dotenv();

        if let Ok(url) = std::env::var("DEPLOY_URL") {
            self.remote.url = url;
        }
        if let Ok(token) = std::env::var("DEPLOY_TOKEN") {
            self.remote.token = token;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.remote.url.trim();
        if url.is_empty() {
            return Err(ClientError::Config(
                "remote.url is not set (run `deploy init` or set DEPLOY_URL)".into(),
            ));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "remote.url must start with http:// or https://, got {url}"
            )));
        }
        if self.remote.token.trim().is_empty() {
            return Err(ClientError::Config(
                "remote.token is not set (set DEPLOY_TOKEN)".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig::load(dir.path()).unwrap();
        assert_eq!(config.remote.max_retries, 3);
        assert!(config.sync.backups);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut config = ClientConfig::default();
        config.remote.url = "https://example.com:9870".into();
        config.remote.token = "secret-token".into();
        config.sync.ignore = vec!["*.log".into()];
        config.save(dir.path()).unwrap();

        let loaded = ClientConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.remote.url, "https://example.com:9870");
        assert_eq!(loaded.sync.ignore, vec!["*.log".to_string()]);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = ClientConfig::path_for(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "[remote]\nurl = \"http://localhost:9870\"\ntoken = \"t\"\nmax_retries = 0\n",
        )
        .unwrap();

        let config = ClientConfig::load(dir.path()).unwrap();
        assert_eq!(config.remote.max_retries, 0);
        assert_eq!(config.remote.timeout_secs, 60);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_rejects_bad_url() {
        let mut config = ClientConfig::default();
        config.remote.url = "ftp://example.com".into();
        config.remote.token = "t".into();
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }
}
