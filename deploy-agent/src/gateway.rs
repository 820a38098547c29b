//! Request admission and operation dispatch.
//!
//! Admission order is fixed: bearer token, IP allow-list, rate limit. Only
//! then is the operation routed, and each operation resolves its own paths
//! through [`PathGuard`].

use crate::config::Config;
use crate::extract::ArchiveExtractor;
use crate::maintenance::MaintenanceFlag;
use crate::ops::{admin, files, query};
use crate::security::auth::{bearer_token, tokens_match};
use crate::security::ip::IpAllowList;
use crate::security::{PathGuard, RateDecision, RateLimiter};
use crate::trash::TrashStore;
use crate::{AgentError, Result};
use axum::http::{HeaderMap, StatusCode};
use deploy_core::backup::{BackupManager, BackupManifest};
use deploy_core::ignore::IgnoreMatcher;
use deploy_core::protocol::{
    ApiResponse, HealthResponse, HealthStatus, Request, TestResponse, HEADER_CLIENT_ID,
};
use deploy_core::walker::WalkOptions;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Who is acting, as far as the agent can tell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub ip: Option<IpAddr>,
    pub client_id: Option<String>,
}

impl ClientIdentity {
    pub fn from_request(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> Self {
        let forwarded = trust_forwarded
            .then(|| headers.get("x-forwarded-for"))
            .flatten()
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());

        let client_id = headers
            .get(HEADER_CLIENT_ID)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().chars().take(128).collect::<String>())
            .filter(|v| !v.is_empty());

        Self {
            ip: forwarded.or(peer.map(|p| p.ip())),
            client_id,
        }
    }

    /// Rate-limit key: the address when known, else the declared id.
    pub fn rate_key(&self) -> String {
        match (&self.ip, &self.client_id) {
            (Some(ip), _) => ip.to_string(),
            (None, Some(id)) => id.clone(),
            (None, None) => "anonymous".to_string(),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = self.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into());
        match &self.client_id {
            Some(id) => write!(f, "{ip} ({id})"),
            None => write!(f, "{ip}"),
        }
    }
}

/// A serialized response and the status it goes out with.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl Reply {
    pub fn ok<T: Serialize>(data: T) -> Result<Self> {
        Self::with_status(StatusCode::OK, ApiResponse::ok(data))
    }

    pub fn message<T: Serialize>(data: T, message: impl Into<String>) -> Result<Self> {
        Self::with_status(StatusCode::OK, ApiResponse::ok(data).with_message(message))
    }

    pub fn with_status<T: Serialize>(status: StatusCode, response: ApiResponse<T>) -> Result<Self> {
        Ok(Self {
            status,
            body: serde_json::to_value(response)?,
        })
    }
}

pub struct Gateway {
    pub(crate) config: Config,
    pub(crate) guard: PathGuard,
    pub(crate) state_dir: PathBuf,
    pub(crate) ip_allow: IpAllowList,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) trash: TrashStore,
    pub(crate) backups: BackupManager,
    pub(crate) maintenance: MaintenanceFlag,
    pub(crate) extractor: ArchiveExtractor,
    started_at: Instant,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Self> {
        let guard = PathGuard::new(&config.project.root)?;
        let state_dir = match &config.project.state_dir {
            Some(dir) => dir.clone(),
            None => guard.root().join(deploy_core::STATE_DIR),
        };
        std::fs::create_dir_all(&state_dir)?;

        let ip_allow = IpAllowList::parse(&config.security.allowed_ips)?;
        let rate_limiter = RateLimiter::new(&state_dir, config.security.rate_limit_per_minute);
        let trash = TrashStore::new(&state_dir);
        let backups = BackupManager::new(
            guard.root(),
            state_dir.join("backups"),
            config.backup.retention,
        );
        let maintenance = MaintenanceFlag::new(&state_dir);
        let extractor = ArchiveExtractor::new(config.security.max_file_size);

        Ok(Self {
            config,
            guard,
            state_dir,
            ip_allow,
            rate_limiter,
            trash,
            backups,
            maintenance,
            extractor,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Ignore predicate for walks, re-read so uploaded ignore files apply.
    pub fn matcher(&self) -> IgnoreMatcher {
        IgnoreMatcher::for_root(self.root(), &[])
    }

    /// Walk options keeping symlinked files inside the project root.
    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            confine_to: Some(self.root().to_path_buf()),
            ..WalkOptions::default()
        }
    }

    /// Authenticate, check the allow-list and charge the rate limit.
    ///
    /// Blocking: the rate window is a locked file.
    pub fn admit(&self, headers: &HeaderMap, client: &ClientIdentity) -> Result<()> {
        let authorized = bearer_token(headers)
            .map(|token| tokens_match(token, &self.config.security.token))
            .unwrap_or(false);
        if !authorized {
            warn!(client = %client, "Rejected request: invalid or missing token");
            return Err(AgentError::Unauthorized);
        }

        if !self.ip_allow.is_empty() {
            let allowed = client.ip.map(|ip| self.ip_allow.allows(ip)).unwrap_or(false);
            if !allowed {
                warn!(client = %client, "Rejected request: IP not in allow-list");
                return Err(AgentError::IpBlocked(
                    client.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".into()),
                ));
            }
        }

        match self.rate_limiter.check(&client.rate_key())? {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited { retry_after_secs } => {
                warn!(client = %client, retry_after = retry_after_secs, "Rejected request: rate limited");
                Err(AgentError::RateLimited {
                    retry_after: retry_after_secs,
                })
            }
        }
    }

    /// Refuse mutations while the maintenance flag is set.
    pub fn ensure_writable(&self) -> Result<()> {
        if let Some(state) = self.maintenance.current()? {
            return Err(AgentError::Maintenance(
                state
                    .message
                    .unwrap_or_else(|| "agent is locked for maintenance".into()),
            ));
        }
        Ok(())
    }

    /// Back up with the project's current ignore rules.
    pub fn create_backup(
        &self,
        scope: Option<&[String]>,
        description: Option<String>,
    ) -> Result<BackupManifest> {
        Ok(self.backups.create_filtered(&self.matcher(), scope, description)?)
    }

    /// Snapshot `paths` that currently exist, when automatic backups are on.
    pub fn backup_before(&self, paths: &[String], action: &str) -> Result<Option<String>> {
        if !self.config.backup.enabled {
            return Ok(None);
        }
        let existing: Vec<String> = paths
            .iter()
            .filter(|p| !p.is_empty() && self.root().join(p.as_str()).exists())
            .cloned()
            .collect();
        if existing.is_empty() {
            return Ok(None);
        }
        let manifest = self.create_backup(
            Some(&existing),
            Some(format!("automatic backup before {action}")),
        )?;
        Ok(Some(manifest.id))
    }

    pub fn health(&self) -> HealthResponse {
        let mut checks = BTreeMap::new();
        checks.insert("root_readable".to_string(), std::fs::read_dir(self.root()).is_ok());

        let probe = self.state_dir.join(".health-probe");
        let writable = std::fs::write(&probe, b"ok").and_then(|_| std::fs::remove_file(&probe)).is_ok();
        checks.insert("state_writable".to_string(), writable);

        let disk_ok = query::disk_stats(self.root())
            .map(|disk| disk.free_bytes >= self.config.security.min_free_bytes)
            .unwrap_or(true);
        checks.insert("disk_space".to_string(), disk_ok);

        let maintenance = self.maintenance.current().ok().flatten();
        let status = if maintenance.is_some() {
            HealthStatus::Maintenance
        } else if checks.values().all(|ok| *ok) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            checks,
            maintenance_message: maintenance.and_then(|m| m.message),
        }
    }

    /// 200 when healthy, 503 otherwise; the body is valid either way.
    pub fn health_reply(&self) -> Result<Reply> {
        let health = self.health();
        let status = if health.status == HealthStatus::Healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        Reply::with_status(status, ApiResponse::ok(health))
    }

    /// Route one admitted request. Blocking.
    pub fn dispatch(&self, request: Request, client: &ClientIdentity) -> Result<Reply> {
        let action = request.action();
        if request.is_mutating() {
            self.ensure_writable()?;
        }

        let result = self.route(request);
        match &result {
            Ok(reply) => info!(client = %client, action, status = reply.status.as_u16(), "Handled request"),
            Err(e) => warn!(client = %client, action, status = e.status().as_u16(), "Request failed: {}", e),
        }
        result
    }

    fn route(&self, request: Request) -> Result<Reply> {
        match request {
            Request::Test => Reply::message(
                TestResponse {
                    agent_id: self.config.agent.id.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    root: self.root().display().to_string(),
                },
                "connection ok",
            ),
            Request::Health => self.health_reply(),
            Request::List => Reply::ok(files::list(self)?),
            Request::Delete { path, permanent } => {
                let response = files::delete(self, &path, permanent)?;
                let message = if permanent { "deleted permanently" } else { "moved to trash" };
                Reply::message(response, message)
            }
            Request::Trash { paths } => Reply::ok(admin::trash(self, &paths)),
            Request::ListTrash => Reply::ok(admin::list_trash(self)?),
            Request::RestoreTrash { id, force } => Reply::ok(admin::restore_trash(self, &id, force)?),
            Request::EmptyTrash => Reply::ok(admin::empty_trash(self)?),
            Request::Move { items, mode, overwrite } => {
                Reply::ok(files::move_items(self, &items, mode, overwrite))
            }
            Request::Rename { paths, find, replace } => {
                Reply::ok(files::rename(self, &paths, &find, &replace)?)
            }
            Request::Extract { path, destination, overwrite } => {
                Reply::ok(admin::extract(self, &path, destination.as_deref(), overwrite)?)
            }
            Request::Mkdir { path } => Reply::ok(files::mkdir(self, &path)?),
            Request::Touch { path } => Reply::ok(files::touch(self, &path)?),
            Request::Write { path, content, encoding, append } => {
                Reply::ok(files::write(self, &path, &content, encoding, append)?)
            }
            Request::Read { path, encoding, offset, lines } => {
                Reply::ok(files::read(self, &path, encoding, offset, lines)?)
            }
            Request::Edit { path, find, replace, all } => {
                Reply::ok(files::edit(self, &path, &find, &replace, all)?)
            }
            Request::Chmod { path, mode, recursive } => {
                Reply::ok(files::chmod(self, &path, &mode, recursive)?)
            }
            Request::Info { path } => Reply::ok(files::info(self, &path)?),
            Request::Search { pattern, path, limit } => {
                Reply::ok(query::search(self, &pattern, path.as_deref(), limit)?)
            }
            Request::Grep { query: needle, path, context, ignore_case, limit } => Reply::ok(
                query::grep(self, &needle, path.as_deref(), context, ignore_case, limit)?,
            ),
            Request::Stats => Reply::ok(query::stats(self)?),
            Request::Logs { lines, filter } => {
                Reply::ok(query::logs(self, lines, filter.as_deref())?)
            }
            Request::Tree { path, depth } => Reply::ok(query::tree(self, path.as_deref(), depth)?),
            Request::Watch { since } => Reply::ok(query::watch(self, since)?),
            Request::Lock { message } => Reply::message(admin::lock(self, message)?, "maintenance mode on"),
            Request::Unlock => Reply::message(admin::unlock(self)?, "maintenance mode off"),
            Request::Backup { paths, description } => {
                Reply::ok(admin::backup(self, paths.as_deref(), description)?)
            }
            Request::Backups => Reply::ok(admin::backups(self)?),
            Request::Restore { id, paths } => Reply::ok(admin::restore(self, &id, paths.as_deref())?),
            Request::DeleteBackup { id } => {
                admin::delete_backup(self, &id)?;
                Reply::message(deploy_core::protocol::Empty {}, format!("backup {id} deleted"))
            }
        }
    }
}
