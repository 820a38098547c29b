//! Push, pull and sync orchestration.
//!
//! Each run scans the local tree, lists the remote one, diffs both against
//! the stored state and then transfers one file at a time. The stored state
//! only moves forward for transfers the agent acknowledged, so an
//! interrupted run resumes from an accurate baseline.

use crate::config::ClientConfig;
use crate::diff::{self, ConflictPolicy, DiffResult};
use crate::error::{BatchReport, ClientError, Result};
use crate::queue::{OperationKind, OperationQueue};
use crate::scanner::LocalScanner;
use crate::state::{SyncState, SyncStateStore};
use crate::transfer::progress_stream::ByteCallback;
use crate::transfer::{ProgressReporter, ProgressTracker, TransportClient};
use chrono::Utc;
use deploy_core::backup::BackupManager;
use deploy_core::paths::normalize_relative;
use deploy_core::walker::mtime_millis;
use deploy_core::{FileIndex, FileRecord, STATE_DIR};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Directory under the state dir holding local snapshots
pub const BACKUPS_DIR: &str = "backups";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pull,
    Both,
}

impl Direction {
    fn pushes(self) -> bool {
        matches!(self, Direction::Push | Direction::Both)
    }

    fn pulls(self) -> bool {
        matches!(self, Direction::Pull | Direction::Both)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Plan only; nothing is transferred or recorded
    pub dry_run: bool,
    pub policy: ConflictPolicy,
    /// Push local deletions to the remote trash
    pub delete_remote: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            policy: ConflictPolicy::Report,
            delete_remote: true,
        }
    }
}

/// Fresh view of both sides and what separates them.
#[derive(Debug, Clone)]
pub struct Plan {
    pub local: FileIndex,
    pub remote: FileIndex,
    pub diff: DiffResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    pub deleted: Vec<String>,
    /// Left for the user to resolve
    pub conflicts: Vec<String>,
    pub batch: BatchReport,
    /// Local snapshot taken before a pull overwrote files
    pub backup_id: Option<String>,
    pub dry_run: bool,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.batch.is_clean() && self.conflicts.is_empty()
    }
}

type SharedTracker = Arc<Mutex<ProgressTracker>>;

pub struct SyncEngine {
    root: PathBuf,
    transport: TransportClient,
    scanner: LocalScanner,
    store: SyncStateStore,
    queue: OperationQueue,
    backups: Option<BackupManager>,
    reporter: Option<ProgressReporter>,
}

impl SyncEngine {
    pub fn new(root: impl Into<PathBuf>, config: &ClientConfig) -> Result<Self> {
        let root = root.into();
        let state_dir = root.join(STATE_DIR);
        let scanner = LocalScanner::new(&root, &config.sync.ignore);
        let backups = config.sync.backups.then(|| {
            BackupManager::new(&root, state_dir.join(BACKUPS_DIR), config.sync.retention)
                .with_matcher(scanner.matcher().clone())
        });

        Ok(Self {
            transport: TransportClient::new(&config.remote)?,
            store: SyncStateStore::new(&state_dir),
            queue: OperationQueue::new(&state_dir),
            scanner,
            backups,
            reporter: None,
            root,
        })
    }

    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn state(&self) -> Result<SyncState> {
        Ok(self.store.load()?)
    }

    /// Scan, list and diff without changing anything.
    pub async fn plan(&self) -> Result<Plan> {
        let mut state = self.store.load()?;
        let local = self.scan(&state).await?;

        let matcher = self.scanner.matcher();
        let remote: FileIndex = self
            .transport
            .list()
            .await?
            .iter()
            .filter(|record| !matcher.is_ignored(&record.path, false))
            .cloned()
            .collect();

        state.forget_vanished(&local, &remote);
        let diff = diff::compute(&local, &remote, &state);
        info!(
            "Plan: {} to upload, {} to download, {} to delete, {} in conflict, {} unchanged",
            diff.to_upload.len(),
            diff.to_download.len(),
            diff.to_delete.len(),
            diff.conflicts.len(),
            diff.unchanged.len()
        );
        Ok(Plan {
            local,
            remote,
            diff,
        })
    }

    pub async fn status(&self) -> Result<Plan> {
        self.plan().await
    }

    /// Upload local changes and push local deletions.
    pub async fn push(&self, options: SyncOptions) -> Result<SyncReport> {
        self.run(Direction::Push, options).await
    }

    /// Download remote changes.
    pub async fn pull(&self, options: SyncOptions) -> Result<SyncReport> {
        self.run(Direction::Pull, options).await
    }

    /// Push and pull in one pass over a single plan.
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncReport> {
        self.run(Direction::Both, options).await
    }

    async fn scan(&self, state: &SyncState) -> Result<FileIndex> {
        let scanner = self.scanner.clone();
        let previous = state.local_index.clone();
        let (index, _) = tokio::task::spawn_blocking(move || scanner.scan(&previous))
            .await
            .map_err(|e| ClientError::Io(std::io::Error::other(e.to_string())))??;
        Ok(index)
    }

    async fn run(&self, direction: Direction, options: SyncOptions) -> Result<SyncReport> {
        let plan = self.plan().await?;
        let diff = plan.diff.clone().resolve(options.policy);

        let mut report = SyncReport {
            conflicts: diff.conflicts.iter().cloned().collect(),
            dry_run: options.dry_run,
            ..SyncReport::default()
        };

        let uploads = if direction.pushes() {
            self.ordered(OperationKind::Upload, &diff.to_upload)?
        } else {
            Vec::new()
        };
        let deletes = if direction.pushes() && options.delete_remote {
            self.ordered(OperationKind::Delete, &diff.to_delete)?
        } else {
            Vec::new()
        };
        let downloads = if direction.pulls() {
            self.ordered(OperationKind::Download, &diff.to_download)?
        } else {
            Vec::new()
        };

        if options.dry_run {
            report.uploaded = uploads;
            report.downloaded = downloads;
            report.deleted = deletes;
            return Ok(report);
        }

        let mut state = self.store.load()?;
        let vanished = state.forget_vanished(&plan.local, &plan.remote);
        if !vanished.is_empty() {
            debug!("Forgot {} paths deleted on both sides", vanished.len());
        }
        for path in &diff.unchanged {
            if let Some(record) = plan.local.get(path) {
                state.record_agreed(record.clone());
            }
        }
        self.store.save(&state)?;

        let total_bytes = uploads
            .iter()
            .filter_map(|p| plan.local.get(p))
            .chain(downloads.iter().filter_map(|p| plan.remote.get(p)))
            .map(|r| r.size)
            .sum();
        let tracker: SharedTracker = Arc::new(Mutex::new(ProgressTracker::new(
            uploads.len() + downloads.len(),
            total_bytes,
        )));

        for path in &uploads {
            self.upload_one(path, &plan.local, &mut state, &tracker, &mut report)
                .await?;
        }
        for path in &deletes {
            self.delete_one(path, &mut state, &mut report).await?;
        }
        if !downloads.is_empty() {
            report.backup_id = self.backup_before_pull(&downloads).await?;
            for path in &downloads {
                self.download_one(path, &plan.remote, &mut state, &tracker, &mut report)
                    .await?;
            }
        }

        let now = Utc::now();
        if direction.pushes() {
            state.last_push = Some(now);
        }
        if direction.pulls() {
            state.last_pull = Some(now);
        }
        if direction == Direction::Both {
            state.last_sync = Some(now);
            if report.is_clean() {
                state.first_sync_completed = true;
            }
        }
        self.store.save(&state)?;

        info!(
            "Done: {} uploaded, {} downloaded, {} deleted, {} failed, {} conflicts",
            report.uploaded.len(),
            report.downloaded.len(),
            report.deleted.len(),
            report.batch.failed,
            report.conflicts.len()
        );
        Ok(report)
    }

    /// Queued retries first, then the rest in path order. Queue entries
    /// the plan no longer needs are dropped.
    fn ordered(&self, kind: OperationKind, paths: &BTreeSet<String>) -> Result<Vec<String>> {
        let mut ordered = Vec::with_capacity(paths.len());
        for queued in self.queue.pending(kind)? {
            if paths.contains(&queued) {
                ordered.push(queued);
            } else {
                self.queue.clear(kind, &queued)?;
            }
        }
        let first: BTreeSet<String> = ordered.iter().cloned().collect();
        ordered.extend(paths.iter().filter(|p| !first.contains(*p)).cloned());
        Ok(ordered)
    }

    async fn upload_one(
        &self,
        path: &str,
        local: &FileIndex,
        state: &mut SyncState,
        tracker: &SharedTracker,
        report: &mut SyncReport,
    ) -> Result<()> {
        let Some(record) = local.get(path) else {
            return Ok(());
        };
        start_file(tracker, path);

        let result = self
            .transport
            .upload(
                &self.root.join(path),
                path,
                &record.hash,
                record.size,
                self.byte_callback(tracker),
            )
            .await;

        match result {
            Ok(_) => {
                state.record_agreed(record.clone());
                self.store.save(state)?;
                self.queue.clear(OperationKind::Upload, path)?;
                report.uploaded.push(path.to_string());
                report.batch.record_success();
            }
            Err(e) => self.record_failure(OperationKind::Upload, path, &e, report)?,
        }
        self.finish_file(tracker, record.size);
        Ok(())
    }

    async fn delete_one(
        &self,
        path: &str,
        state: &mut SyncState,
        report: &mut SyncReport,
    ) -> Result<()> {
        match self.transport.delete(path, false).await {
            Ok(_) | Err(ClientError::NotFound(_)) => {
                state.record_removed(path);
                self.store.save(state)?;
                self.queue.clear(OperationKind::Delete, path)?;
                report.deleted.push(path.to_string());
                report.batch.record_success();
            }
            Err(e) => self.record_failure(OperationKind::Delete, path, &e, report)?,
        }
        Ok(())
    }

    async fn download_one(
        &self,
        path: &str,
        remote: &FileIndex,
        state: &mut SyncState,
        tracker: &SharedTracker,
        report: &mut SyncReport,
    ) -> Result<()> {
        let size_hint = remote.get(path).map(|r| r.size).unwrap_or(0);
        let Some(dest) = local_path(&self.root, path) else {
            let err = ClientError::Forbidden(format!("refusing remote path {path:?}"));
            self.record_failure(OperationKind::Download, path, &err, report)?;
            return Ok(());
        };
        start_file(tracker, path);

        let result = self
            .transport
            .download(path, &dest, size_hint, self.byte_callback(tracker))
            .await;

        match result {
            Ok(file) => {
                let mtime = std::fs::metadata(&dest)
                    .and_then(|m| m.modified())
                    .ok();
                state.record_agreed(FileRecord {
                    path: path.to_string(),
                    hash: file.hash,
                    size: file.size,
                    mtime: mtime_millis(mtime),
                });
                self.store.save(state)?;
                self.queue.clear(OperationKind::Download, path)?;
                report.downloaded.push(path.to_string());
                report.batch.record_success();
            }
            Err(e) => self.record_failure(OperationKind::Download, path, &e, report)?,
        }
        self.finish_file(tracker, size_hint);
        Ok(())
    }

    fn record_failure(
        &self,
        kind: OperationKind,
        path: &str,
        error: &ClientError,
        report: &mut SyncReport,
    ) -> Result<()> {
        warn!("{:?} of {} failed: {}", kind, path, error);
        self.queue.record_failure(kind, path, &error.to_string())?;
        report.batch.record_failure(path, error);
        Ok(())
    }

    /// Snapshot the local files a pull is about to overwrite.
    async fn backup_before_pull(&self, downloads: &[String]) -> Result<Option<String>> {
        let Some(backups) = self.backups.clone() else {
            return Ok(None);
        };
        let existing: Vec<String> = downloads
            .iter()
            .filter(|p| self.root.join(p.as_str()).is_file())
            .cloned()
            .collect();
        if existing.is_empty() {
            return Ok(None);
        }

        let manifest = tokio::task::spawn_blocking(move || {
            backups.create(Some(existing.as_slice()), Some("before pull".to_string()))
        })
        .await
        .map_err(|e| ClientError::Io(std::io::Error::other(e.to_string())))??;
        info!(
            "Backed up {} local files as {} before pull",
            manifest.file_count, manifest.id
        );
        Ok(Some(manifest.id))
    }

    fn byte_callback(&self, tracker: &SharedTracker) -> Option<ByteCallback> {
        let reporter = self.reporter.clone()?;
        let tracker = tracker.clone();
        Some(Arc::new(move |bytes| {
            if let Ok(mut tracker) = tracker.lock() {
                reporter(tracker.file_bytes(bytes));
            }
        }))
    }

    fn finish_file(&self, tracker: &SharedTracker, size: u64) {
        if let Ok(mut tracker) = tracker.lock() {
            let snapshot = tracker.finish_file(size);
            if let Some(reporter) = &self.reporter {
                reporter(snapshot);
            }
        }
    }
}

fn start_file(tracker: &SharedTracker, path: &str) {
    if let Ok(mut tracker) = tracker.lock() {
        tracker.start_file(path);
    }
}

/// Where a remote path lands locally; `None` for anything that is not a
/// clean relative path.
fn local_path(root: &Path, path: &str) -> Option<PathBuf> {
    normalize_relative(path)
        .filter(|normalized| normalized == path)
        .map(|normalized| root.join(normalized))
}
