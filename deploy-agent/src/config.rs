//! Configuration management for the deploy agent.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    pub project: ProjectConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent identifier
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// Address to bind
    #[serde(default = "default_bind")]
    pub bind: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project root every request path is resolved against
    pub root: PathBuf,

    /// Agent state (trash, backups, rate windows). Defaults to `<root>/.deploy`
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Shared bearer token
    pub token: String,

    /// Exact IPs or CIDR ranges; empty allows everyone
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Honor the first `x-forwarded-for` address (agent behind a proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Requests per client per 60 seconds (0 disables limiting)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,

    /// Largest file accepted or served, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Health degrades below this much free disk space
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Snapshot affected files before overwriting or removing them
    #[serde(default = "default_backup_enabled")]
    pub enabled: bool,

    /// Backups kept after pruning (0 keeps all)
    #[serde(default = "default_retention")]
    pub retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file; the `logs` operation tails it
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
fn default_agent_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "deploy-agent-01".to_string())
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9870
}

fn default_rate_limit() -> usize {
    120
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_min_free_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_backup_enabled() -> bool {
    true
}

fn default_retention() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: default_backup_enabled(),
            retention: default_retention(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Configuration for `root` with every other setting at its default.
    pub fn for_root(root: impl Into<PathBuf>, token: impl Into<String>) -> Self {
        Config {
            agent: AgentConfig::default(),
            project: ProjectConfig {
                root: root.into(),
                state_dir: None,
            },
            security: SecurityConfig {
                token: token.into(),
                allowed_ips: Vec::new(),
                trust_forwarded_for: false,
                rate_limit_per_minute: default_rate_limit(),
                max_file_size: default_max_file_size(),
                min_free_bytes: default_min_free_bytes(),
            },
            backup: BackupConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Load `.env` (if any) and apply `DEPLOY_AGENT_*` overrides.
    pub fn apply_env_overrides(&mut self) {
        let _ = dotenvy::dotenv();

        if let Ok(token) = std::env::var("DEPLOY_AGENT_TOKEN") {
            self.security.token = token;
        }
        if let Ok(root) = std::env::var("DEPLOY_AGENT_ROOT") {
            self.project.root = PathBuf::from(root);
        }
        if let Some(port) = std::env::var("DEPLOY_AGENT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.agent.port = port;
        }
        if let Ok(level) = std::env::var("DEPLOY_AGENT_LOG") {
            self.log.level = level;
        }
    }

    /// Reject configurations the agent must never run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.security.token.trim().len() < 16 {
            return Err(crate::AgentError::Config(
                "security.token must be at least 16 characters".into(),
            ));
        }
        if !self.project.root.is_dir() {
            return Err(crate::AgentError::Config(format!(
                "project.root {} is not a directory",
                self.project.root.display()
            )));
        }
        for entry in &self.security.allowed_ips {
            crate::security::ip::IpRule::parse(entry)?;
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project
            .state_dir
            .clone()
            .unwrap_or_else(|| self.project.root.join(deploy_core::STATE_DIR))
    }
}
