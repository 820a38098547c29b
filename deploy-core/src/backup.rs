//! Versioned snapshots of a working tree.
//!
//! Layout under the backups directory:
//!
//! ```text
//! <backups_dir>/
//! ├─ version.json            # last issued semantic version (lock-guarded)
//! └─ <backup-id>/
//!    ├─ manifest.json        # written last; no manifest means no backup
//!    └─ files/<relative path>
//! ```
//!
//! The same manager runs on the agent (remote backups) and on the client
//! (local backups), so both sides share one manifest shape.

use crate::error::CoreError;
use crate::hash::hash_file;
use crate::ignore::IgnoreMatcher;
use crate::index::{FileIndex, FileRecord};
use crate::lock::{read_json_or_default, update_json, write_json_atomic};
use crate::paths::normalize_relative;
use crate::walker::{walk_files, FileInfo, WalkOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MANIFEST_FILE: &str = "manifest.json";
const VERSION_FILE: &str = "version.json";
const FILES_DIR: &str = "files";

/// Semantic version stamped on each backup; every backup bumps the patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackupVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl BackupVersion {
    pub const INITIAL: BackupVersion = BackupVersion {
        major: 1,
        minor: 0,
        patch: 0,
    };

    pub fn bump_patch(self) -> Self {
        Self {
            patch: self.patch + 1,
            ..self
        }
    }
}

impl fmt::Display for BackupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VersionRecord {
    last: Option<BackupVersion>,
}

/// Manifest written once per backup and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub version: BackupVersion,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub file_count: usize,
    pub total_size: u64,
    pub files: FileIndex,
}

/// Per-file outcome of a restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restored: Vec<String>,
    pub failed: Vec<RestoreFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreFailure {
    pub path: String,
    pub error: String,
}

/// Creates, lists, restores and prunes backups of one working tree.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    backups_dir: PathBuf,
    retention: usize,
    matcher: IgnoreMatcher,
}

impl BackupManager {
    /// `retention` of 0 keeps every backup.
    pub fn new(root: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            root: root.into(),
            backups_dir: backups_dir.into(),
            retention,
            matcher: IgnoreMatcher::new(),
        }
    }

    pub fn with_matcher(mut self, matcher: IgnoreMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Snapshot the whole tree, or only `scope` (files or directories).
    pub fn create(
        &self,
        scope: Option<&[String]>,
        description: Option<String>,
    ) -> crate::Result<BackupManifest> {
        self.create_filtered(&self.matcher, scope, description)
    }

    /// `create` with a caller-supplied ignore predicate, for trees whose
    /// ignore files change while the manager lives.
    pub fn create_filtered(
        &self,
        matcher: &IgnoreMatcher,
        scope: Option<&[String]>,
        description: Option<String>,
    ) -> crate::Result<BackupManifest> {
        let files = self.collect(matcher, scope)?;
        let version = self.next_version()?;
        let created_at = Utc::now();
        let id = format!(
            "backup_{}_{}",
            created_at.format("%Y%m%d_%H%M%S%3f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let backup_dir = self.backups_dir.join(&id);
        let files_dir = backup_dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        let mut index = FileIndex::new();
        for file in files {
            let dest = files_dir.join(&file.relative_path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&file.path, &dest)?;
            index.insert(FileRecord {
                hash: hash_file(&dest)?,
                path: file.relative_path,
                size: file.size,
                mtime: file.mtime,
            });
        }

        let manifest = BackupManifest {
            id,
            version,
            created_at,
            description,
            file_count: index.len(),
            total_size: index.total_size(),
            files: index,
        };
        write_json_atomic(&backup_dir.join(MANIFEST_FILE), &manifest)?;

        info!(
            "Created backup {} (v{}): {} files, {} bytes",
            manifest.id, manifest.version, manifest.file_count, manifest.total_size
        );

        if let Err(e) = self.prune() {
            warn!("Backup retention pruning failed: {}", e);
        }

        Ok(manifest)
    }

    /// All valid backups, newest first.
    pub fn list(&self) -> crate::Result<Vec<BackupManifest>> {
        let entries = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match Self::read_manifest(&entry.path()) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!("Skipping invalid backup {}: {}", entry.path().display(), e),
            }
        }
        manifests.sort_by(|a, b| b.version.cmp(&a.version).then(b.created_at.cmp(&a.created_at)));
        Ok(manifests)
    }

    pub fn get(&self, id: &str) -> crate::Result<BackupManifest> {
        let dir = self.backup_dir(id)?;
        if !dir.is_dir() {
            return Err(CoreError::BackupNotFound(id.to_string()));
        }
        Self::read_manifest(&dir)
    }

    /// Replay a backup onto the working tree, continuing past per-file failures.
    pub fn restore(&self, id: &str, only: Option<&[String]>) -> crate::Result<RestoreReport> {
        let manifest = self.get(id)?;
        let files_dir = self.backup_dir(id)?.join(FILES_DIR);
        let mut report = RestoreReport {
            backup_id: manifest.id.clone(),
            ..Default::default()
        };

        for record in manifest.files.iter() {
            if let Some(only) = only {
                if !only.iter().any(|p| crate::paths::is_within(&record.path, p)) {
                    continue;
                }
            }
            match restore_one(&files_dir, &self.root, record) {
                Ok(()) => report.restored.push(record.path.clone()),
                Err(e) => {
                    warn!("Failed to restore {} from {}: {}", record.path, id, e);
                    report.failed.push(RestoreFailure {
                        path: record.path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Restored backup {}: {} restored, {} failed",
            id,
            report.restored.len(),
            report.failed.len()
        );
        Ok(report)
    }

    pub fn delete(&self, id: &str) -> crate::Result<()> {
        let dir = self.backup_dir(id)?;
        if !dir.is_dir() {
            return Err(CoreError::BackupNotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        info!("Deleted backup {}", id);
        Ok(())
    }

    /// Remove the oldest backups beyond the retention count.
    pub fn prune(&self) -> crate::Result<Vec<String>> {
        if self.retention == 0 {
            return Ok(Vec::new());
        }
        let backups = self.list()?;
        let mut removed = Vec::new();
        for manifest in backups.into_iter().skip(self.retention) {
            fs::remove_dir_all(self.backups_dir.join(&manifest.id))?;
            info!("Pruned backup {} (v{})", manifest.id, manifest.version);
            removed.push(manifest.id);
        }
        Ok(removed)
    }

    /// Last version issued, if any backup was ever created.
    pub fn current_version(&self) -> crate::Result<Option<BackupVersion>> {
        let record: VersionRecord = read_json_or_default(&self.backups_dir.join(VERSION_FILE))?;
        Ok(record.last)
    }

    fn next_version(&self) -> crate::Result<BackupVersion> {
        update_json(&self.backups_dir.join(VERSION_FILE), |record: &mut VersionRecord| {
            let next = record
                .last
                .map(BackupVersion::bump_patch)
                .unwrap_or(BackupVersion::INITIAL);
            record.last = Some(next);
            next
        })
    }

    fn backup_dir(&self, id: &str) -> crate::Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\', '\0']) || id.starts_with('.') {
            return Err(CoreError::InvalidPath(format!("invalid backup id: {id}")));
        }
        Ok(self.backups_dir.join(id))
    }

    fn read_manifest(dir: &Path) -> crate::Result<BackupManifest> {
        let bytes = fs::read(dir.join(MANIFEST_FILE))
            .map_err(|e| CoreError::InvalidManifest(format!("{}: {}", dir.display(), e)))?;
        let manifest: BackupManifest = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::InvalidManifest(format!("{}: {}", dir.display(), e)))?;
        Ok(manifest)
    }

    fn collect(&self, matcher: &IgnoreMatcher, scope: Option<&[String]>) -> crate::Result<Vec<FileInfo>> {
        let options = WalkOptions::confined(&self.root);
        let Some(scope) = scope else {
            return walk_files(&self.root, matcher, &options);
        };

        let mut files = Vec::new();
        for raw in scope {
            let rel = normalize_relative(raw)
                .ok_or_else(|| CoreError::InvalidPath(raw.to_string()))?;
            let path = self.root.join(&rel);
            if path.exists() && !resolves_within(&path, &options) {
                warn!("Backup scope entry {} resolves outside the root, skipping", rel);
                continue;
            }
            if path.is_dir() {
                for mut info in walk_files(&path, matcher, &options)? {
                    info.relative_path = format!("{}/{}", rel, info.relative_path);
                    files.push(info);
                }
            } else if path.is_file() {
                let is_symlink = path.is_symlink();
                let metadata = fs::metadata(&path)?;
                files.push(FileInfo {
                    path,
                    relative_path: rel,
                    size: metadata.len(),
                    mtime: crate::walker::mtime_millis(metadata.modified().ok()),
                    is_symlink,
                    depth: 0,
                });
            } else {
                warn!("Backup scope entry {} does not exist, skipping", rel);
            }
        }
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        files.dedup_by(|a, b| a.relative_path == b.relative_path);
        Ok(files)
    }
}

fn resolves_within(path: &Path, options: &WalkOptions) -> bool {
    match (&options.confine_to, path.canonicalize()) {
        (Some(boundary), Ok(resolved)) => resolved.starts_with(boundary),
        (None, Ok(_)) => true,
        (_, Err(_)) => false,
    }
}

fn restore_one(files_dir: &Path, root: &Path, record: &FileRecord) -> crate::Result<()> {
    let source = files_dir.join(&record.path);
    let actual = hash_file(&source)?;
    if actual != record.hash {
        return Err(CoreError::InvalidManifest(format!(
            "stored copy of {} has hash {} but manifest records {}",
            record.path, actual, record.hash
        )));
    }
    let dest = root.join(&record.path);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&source, &dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use tempfile::TempDir;

    fn setup() -> std::io::Result<(TempDir, BackupManager)> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("site/css"))?;
        fs::write(dir.path().join("site/index.php"), b"<?php echo 1;")?;
        fs::write(dir.path().join("site/css/app.css"), b"body{}")?;
        let manager = BackupManager::new(dir.path().join("site"), dir.path().join("backups"), 3);
        Ok((dir, manager))
    }

    #[test]
    fn test_create_records_every_file() -> crate::Result<()> {
        let (_dir, manager) = setup()?;
        let manifest = manager.create(None, Some("manual".into()))?;

        assert_eq!(manifest.file_count, 2);
        assert_eq!(manifest.total_size, 13 + 6);
        assert_eq!(manifest.version, BackupVersion::INITIAL);
        assert_eq!(
            manifest.files.hash_of("index.php"),
            Some(hash_bytes(b"<?php echo 1;").as_str())
        );
        Ok(())
    }

    #[test]
    fn test_versions_increase_monotonically() -> crate::Result<()> {
        let (_dir, manager) = setup()?;
        let first = manager.create(None, None)?;
        let second = manager.create(None, None)?;
        assert!(second.version > first.version);
        assert_eq!(second.version.to_string(), "1.0.1");
        assert_eq!(manager.current_version()?, Some(second.version));
        Ok(())
    }

    #[test]
    fn test_retention_keeps_newest() -> crate::Result<()> {
        let (_dir, manager) = setup()?;
        let oldest = manager.create(None, None)?;
        for _ in 0..3 {
            manager.create(None, None)?;
        }

        let backups = manager.list()?;
        assert_eq!(backups.len(), 3);
        assert!(backups.iter().all(|b| b.id != oldest.id));
        Ok(())
    }

    #[test]
    fn test_restore_reproduces_hashes() -> crate::Result<()> {
        let (dir, manager) = setup()?;
        let manifest = manager.create(None, None)?;

        fs::write(dir.path().join("site/index.php"), b"tampered")?;
        fs::remove_dir_all(dir.path().join("site/css"))?;

        let report = manager.restore(&manifest.id, None)?;
        assert_eq!(report.restored.len(), 2);
        assert!(report.failed.is_empty());
        for record in manifest.files.iter() {
            assert_eq!(hash_file(&dir.path().join("site").join(&record.path))?, record.hash);
        }
        Ok(())
    }

    #[test]
    fn test_restore_reports_missing_files_and_continues() -> crate::Result<()> {
        let (_dir, manager) = setup()?;
        let manifest = manager.create(None, None)?;
        fs::remove_file(manager.backups_dir().join(&manifest.id).join("files/index.php"))?;

        let report = manager.restore(&manifest.id, None)?;
        assert_eq!(report.restored, vec!["css/app.css".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, "index.php");
        Ok(())
    }

    #[test]
    fn test_scoped_backup() -> crate::Result<()> {
        let (_dir, manager) = setup()?;
        let manifest = manager.create(Some(&["css".to_string(), "missing.txt".to_string()]), None)?;
        assert_eq!(manifest.file_count, 1);
        assert!(manifest.files.contains("css/app.css"));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_links_leaving_root_are_not_backed_up() -> crate::Result<()> {
        let (dir, manager) = setup()?;
        fs::create_dir_all(dir.path().join("private"))?;
        fs::write(dir.path().join("private/.env"), b"APP_KEY=secret")?;
        std::os::unix::fs::symlink(dir.path().join("private/.env"), dir.path().join("site/.env"))?;
        std::os::unix::fs::symlink(dir.path().join("private"), dir.path().join("site/private"))?;

        let whole = manager.create(None, None)?;
        assert_eq!(whole.file_count, 2);
        assert!(!whole.files.contains(".env"));

        let scoped = manager.create(Some(&[".env".to_string(), "private".to_string()]), None)?;
        assert_eq!(scoped.file_count, 0);
        Ok(())
    }

    #[test]
    fn test_matcher_excludes_ignored_files() -> crate::Result<()> {
        let (dir, manager) = setup()?;
        fs::create_dir_all(dir.path().join("site/cache"))?;
        fs::write(dir.path().join("site/cache/page.html"), b"cached")?;

        let manager = manager.with_matcher(IgnoreMatcher::with_patterns(["cache/"]));
        let manifest = manager.create(None, None)?;
        assert_eq!(manifest.file_count, 2);
        assert!(!manifest.files.contains("cache/page.html"));
        Ok(())
    }

    #[test]
    fn test_directory_without_manifest_is_not_a_backup() -> crate::Result<()> {
        let (_dir, manager) = setup()?;
        fs::create_dir_all(manager.backups_dir().join("backup_broken"))?;
        manager.create(None, None)?;
        assert_eq!(manager.list()?.len(), 1);
        assert!(manager.get("backup_broken").is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_traversal_ids() {
        let manager = BackupManager::new("/tmp/a", "/tmp/b", 0);
        assert!(manager.delete("../etc").is_err());
    }
}
