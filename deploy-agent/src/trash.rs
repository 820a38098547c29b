//! Soft-delete store.
//!
//! A trashed item moves to `<state>/trash/<id>/<original relative path>` and
//! an entry is appended to `<state>/trash/index.json`. The physical move and
//! the index write happen under the index lock; if the index cannot be
//! written the item is moved back.

use crate::fsutil::{exists, move_path, prune_empty_dirs, remove_path};
use crate::security::{PathGuard, ResolvedPath};
use crate::{AgentError, Result};
use chrono::Utc;
use deploy_core::lock::{lock_path_for, read_json_or_default, write_json_atomic, ExclusiveLock};
use deploy_core::protocol::TrashEntry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrashIndex {
    entries: Vec<TrashEntry>,
}

#[derive(Debug, Clone)]
pub struct TrashStore {
    dir: PathBuf,
    index_path: PathBuf,
}

impl TrashStore {
    pub fn new(state_dir: &Path) -> Self {
        let dir = state_dir.join("trash");
        let index_path = dir.join("index.json");
        Self { dir, index_path }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> Result<ExclusiveLock> {
        Ok(ExclusiveLock::acquire(&lock_path_for(&self.index_path))?)
    }

    fn read_index(&self) -> Result<TrashIndex> {
        Ok(read_json_or_default(&self.index_path)?)
    }

    fn write_index(&self, index: &TrashIndex) -> Result<()> {
        Ok(write_json_atomic(&self.index_path, index)?)
    }

    fn new_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
    }

    /// Move `target` into the trash and record it.
    pub fn trash(&self, target: &ResolvedPath) -> Result<TrashEntry> {
        if target.is_root() {
            return Err(AgentError::BadRequest("cannot trash the project root".into()));
        }
        if !exists(&target.absolute) {
            return Err(AgentError::NotFound(target.relative.clone()));
        }

        let _lock = self.lock()?;
        let mut index = self.read_index()?;

        let id = Self::new_id();
        let entry = TrashEntry {
            trash_path: format!("{id}/{}", target.relative),
            id,
            original_path: target.relative.clone(),
            trashed_at: Utc::now(),
        };
        let physical = self.dir.join(&entry.trash_path);
        move_path(&target.absolute, &physical)
            .map_err(|e| AgentError::from_io(e, &target.relative))?;

        index.entries.push(entry.clone());
        if let Err(e) = self.write_index(&index) {
            warn!("Trash index write failed, moving {} back", target.relative);
            if let Err(undo) = move_path(&physical, &target.absolute) {
                warn!("Rollback of {} failed: {}", target.relative, undo);
            }
            return Err(e);
        }

        info!(path = %entry.original_path, id = %entry.id, "Moved to trash");
        Ok(entry)
    }

    pub fn list(&self) -> Result<Vec<TrashEntry>> {
        let _lock = self.lock()?;
        Ok(self.read_index()?.entries)
    }

    /// Move a trashed item back to its original path.
    ///
    /// Without `force` an occupied destination is a conflict; with it the
    /// destination is removed first.
    pub fn restore(&self, id: &str, force: bool, guard: &PathGuard) -> Result<TrashEntry> {
        let _lock = self.lock()?;
        let mut index = self.read_index()?;

        let position = index
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| AgentError::NotFound(format!("trash entry {id}")))?;
        let entry = index.entries[position].clone();

        let physical = self.dir.join(&entry.trash_path);
        if !exists(&physical) {
            return Err(AgentError::NotFound(format!(
                "trashed item for {id} is missing"
            )));
        }

        let destination = guard.resolve_entry(&entry.original_path)?;
        if exists(&destination.absolute) {
            if !force {
                return Err(AgentError::Conflict(format!(
                    "{} already exists",
                    entry.original_path
                )));
            }
            remove_path(&destination.absolute)
                .map_err(|e| AgentError::from_io(e, &entry.original_path))?;
        }

        move_path(&physical, &destination.absolute)
            .map_err(|e| AgentError::from_io(e, &entry.original_path))?;
        if let Some(parent) = physical.parent() {
            prune_empty_dirs(parent, &self.dir);
        }

        index.entries.remove(position);
        self.write_index(&index)?;

        info!(path = %entry.original_path, id = %entry.id, "Restored from trash");
        Ok(entry)
    }

    /// Permanently remove every trashed item. Returns the number of entries.
    pub fn empty(&self) -> Result<usize> {
        let _lock = self.lock()?;
        let mut index = self.read_index()?;
        let removed = index.entries.len();

        for entry in &index.entries {
            let entry_dir = self.dir.join(&entry.id);
            if exists(&entry_dir) {
                if let Err(e) = remove_path(&entry_dir) {
                    warn!("Failed to remove trash entry {}: {}", entry.id, e);
                }
            }
        }

        index.entries.clear();
        self.write_index(&index)?;
        info!("Emptied trash ({} entries)", removed);
        Ok(removed)
    }
}
