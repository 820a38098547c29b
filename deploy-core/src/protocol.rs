//! Wire protocol between the deploy client and the deploy agent.
//!
//! JSON operations are `POST /api` with a body tagged by `action`. Uploads
//! and downloads use dedicated streaming endpoints with metadata in headers.
//! Every response is an [`ApiResponse`] envelope.

use crate::backup::{BackupManifest, BackupVersion};
use crate::index::FileIndex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_PATH: &str = "/api";
pub const UPLOAD_PATH: &str = "/api/upload";
pub const DOWNLOAD_PATH: &str = "/api/download";
pub const HEALTH_PATH: &str = "/health";
pub const VERSION_PATH: &str = "/version";

pub const HEADER_CLIENT_ID: &str = "x-client-id";
pub const HEADER_RELATIVE_PATH: &str = "x-relative-path";
pub const HEADER_CONTENT_HASH: &str = "x-content-hash";
pub const HEADER_TOTAL_SIZE: &str = "x-total-size";
pub const HEADER_FILE_SIZE: &str = "x-file-size";

/// Every JSON operation the agent understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    Test,
    Health,
    List,
    Delete {
        path: String,
        /// Bypass the trash; irreversible
        #[serde(default)]
        permanent: bool,
    },
    Trash {
        paths: Vec<String>,
    },
    ListTrash,
    RestoreTrash {
        id: String,
        #[serde(default)]
        force: bool,
    },
    EmptyTrash,
    Move {
        items: Vec<MoveItem>,
        #[serde(default)]
        mode: MoveMode,
        #[serde(default)]
        overwrite: bool,
    },
    Rename {
        paths: Vec<String>,
        find: String,
        replace: String,
    },
    Extract {
        path: String,
        #[serde(default)]
        destination: Option<String>,
        #[serde(default)]
        overwrite: bool,
    },
    Mkdir {
        path: String,
    },
    Touch {
        path: String,
    },
    Write {
        path: String,
        content: String,
        #[serde(default)]
        encoding: Encoding,
        #[serde(default)]
        append: bool,
    },
    Read {
        path: String,
        #[serde(default)]
        encoding: Encoding,
        /// First line to return (0-based)
        #[serde(default)]
        offset: Option<usize>,
        /// Number of lines to return
        #[serde(default)]
        lines: Option<usize>,
    },
    Edit {
        path: String,
        find: String,
        replace: String,
        #[serde(default)]
        all: bool,
    },
    Chmod {
        path: String,
        /// Octal mode such as `"755"` or `"0644"`
        mode: String,
        #[serde(default)]
        recursive: bool,
    },
    Info {
        path: String,
    },
    Search {
        pattern: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Grep {
        query: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        context: usize,
        #[serde(default)]
        ignore_case: bool,
        #[serde(default)]
        limit: Option<usize>,
    },
    Stats,
    Logs {
        #[serde(default)]
        lines: Option<usize>,
        #[serde(default)]
        filter: Option<String>,
    },
    Tree {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        depth: Option<usize>,
    },
    Watch {
        since: DateTime<Utc>,
    },
    Lock {
        #[serde(default)]
        message: Option<String>,
    },
    Unlock,
    Backup {
        #[serde(default)]
        paths: Option<Vec<String>>,
        #[serde(default)]
        description: Option<String>,
    },
    Backups,
    Restore {
        id: String,
        #[serde(default)]
        paths: Option<Vec<String>>,
    },
    DeleteBackup {
        id: String,
    },
}

impl Request {
    /// Wire name of the operation, used in logs.
    pub fn action(&self) -> &'static str {
        match self {
            Request::Test => "test",
            Request::Health => "health",
            Request::List => "list",
            Request::Delete { .. } => "delete",
            Request::Trash { .. } => "trash",
            Request::ListTrash => "listTrash",
            Request::RestoreTrash { .. } => "restoreTrash",
            Request::EmptyTrash => "emptyTrash",
            Request::Move { .. } => "move",
            Request::Rename { .. } => "rename",
            Request::Extract { .. } => "extract",
            Request::Mkdir { .. } => "mkdir",
            Request::Touch { .. } => "touch",
            Request::Write { .. } => "write",
            Request::Read { .. } => "read",
            Request::Edit { .. } => "edit",
            Request::Chmod { .. } => "chmod",
            Request::Info { .. } => "info",
            Request::Search { .. } => "search",
            Request::Grep { .. } => "grep",
            Request::Stats => "stats",
            Request::Logs { .. } => "logs",
            Request::Tree { .. } => "tree",
            Request::Watch { .. } => "watch",
            Request::Lock { .. } => "lock",
            Request::Unlock => "unlock",
            Request::Backup { .. } => "backup",
            Request::Backups => "backups",
            Request::Restore { .. } => "restore",
            Request::DeleteBackup { .. } => "deleteBackup",
        }
    }

    /// Operations that change the remote tree; refused in maintenance mode.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Request::Delete { .. }
                | Request::Trash { .. }
                | Request::RestoreTrash { .. }
                | Request::EmptyTrash
                | Request::Move { .. }
                | Request::Rename { .. }
                | Request::Extract { .. }
                | Request::Mkdir { .. }
                | Request::Touch { .. }
                | Request::Write { .. }
                | Request::Edit { .. }
                | Request::Chmod { .. }
                | Request::Restore { .. }
                | Request::Backup { .. }
                | Request::DeleteBackup { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveItem {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveMode {
    #[default]
    Move,
    Copy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Plain,
    Base64,
}

/// Response envelope: `{success, message|error, ...payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            error: None,
            data,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Body of every failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Payload-less success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResponse {
    pub agent_id: String,
    pub version: String,
    pub root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub checks: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub count: usize,
    pub files: FileIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub path: String,
    pub hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trash_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub path: String,
    pub error: String,
}

/// Aggregate result of a batch operation that continues past item failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse<T> {
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<T>,
    pub errors: Vec<ItemError>,
}

impl<T> Default for BatchResponse<T> {
    fn default() -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            items: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> BatchResponse<T> {
    pub fn push_ok(&mut self, item: T) {
        self.succeeded += 1;
        self.items.push(item);
    }

    pub fn push_err(&mut self, path: impl Into<String>, error: impl ToString) {
        self.failed += 1;
        self.errors.push(ItemError {
            path: path.into(),
            error: error.to_string(),
        });
    }
}

/// Soft-delete record kept in the trash index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashEntry {
    pub id: String,
    pub original_path: String,
    /// Location of the moved item, relative to the trash directory
    pub trash_path: String,
    pub trashed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashListResponse {
    pub entries: Vec<TrashEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTrashResponse {
    pub id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyTrashResponse {
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedItem {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub destination: String,
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathResponse {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub path: String,
    pub hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub path: String,
    pub content: String,
    pub encoding: Encoding,
    /// Hash and size of the whole file, not of the returned slice
    pub hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditResponse {
    pub path: String,
    pub replacements: usize,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChmodResponse {
    pub path: String,
    pub mode: String,
    pub changed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Permission bits as an octal string
    pub mode: String,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub matches: Vec<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    /// 1-based line number
    pub line: usize,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepResponse {
    pub matches: Vec<GrepMatch>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    pub count: usize,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_files: usize,
    pub total_dirs: usize,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskStats>,
    /// Histogram keyed by lowercase extension (`""` for none)
    pub types: BTreeMap<String, TypeStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeResponse {
    pub tree: TreeNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchChange {
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResponse {
    pub since: DateTime<Utc>,
    pub changes: Vec<WatchChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Manifest summary without the per-file listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSummary {
    pub id: String,
    pub version: BackupVersion,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub file_count: usize,
    pub total_size: u64,
}

impl From<&BackupManifest> for BackupSummary {
    fn from(manifest: &BackupManifest) -> Self {
        Self {
            id: manifest.id.clone(),
            version: manifest.version,
            created_at: manifest.created_at,
            description: manifest.description.clone(),
            file_count: manifest.file_count,
            total_size: manifest.total_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResponse {
    pub backup: BackupSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupsResponse {
    pub backups: Vec<BackupSummary>,
}
