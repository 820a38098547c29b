//! Three-way change detection.
//!
//! Local and remote hashes are compared against the remote hash both sides
//! last agreed on, which acts as the common ancestor. A path edited on both
//! sides since then is a conflict; a path edited identically on both sides
//! is not.

use crate::state::SyncState;
use deploy_core::FileIndex;
use serde::Serialize;
use std::collections::BTreeSet;

/// Where every path ends up. Each path is in exactly one set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub to_upload: BTreeSet<String>,
    pub to_download: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
    pub conflicts: BTreeSet<String>,
    /// Identical on both sides
    pub unchanged: BTreeSet<String>,
}

/// How a caller folds conflicts into transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Leave conflicts for the user
    #[default]
    Report,
    PreferLocal,
    PreferRemote,
}

impl DiffResult {
    /// Nothing to transfer and nothing in conflict.
    pub fn is_clean(&self) -> bool {
        self.to_upload.is_empty()
            && self.to_download.is_empty()
            && self.to_delete.is_empty()
            && self.conflicts.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.to_upload.len() + self.to_download.len() + self.to_delete.len() + self.conflicts.len()
    }

    /// Move conflicts into uploads or downloads per `policy`.
    pub fn resolve(mut self, policy: ConflictPolicy) -> Self {
        let conflicts = std::mem::take(&mut self.conflicts);
        match policy {
            ConflictPolicy::Report => self.conflicts = conflicts,
            ConflictPolicy::PreferLocal => self.to_upload.extend(conflicts),
            ConflictPolicy::PreferRemote => self.to_download.extend(conflicts),
        }
        self
    }
}

/// Partition `local` and `remote` against the last agreed state.
pub fn compute(local: &FileIndex, remote: &FileIndex, state: &SyncState) -> DiffResult {
    let mut result = DiffResult::default();

    for record in local.iter() {
        let path = record.path.clone();
        let local_hash = record.hash.as_str();

        let Some(remote_hash) = remote.hash_of(&record.path) else {
            result.to_upload.insert(path);
            continue;
        };
        if remote_hash == local_hash {
            result.unchanged.insert(path);
            continue;
        }

        match state.last_known_remote_hash(&record.path) {
            Some(base) if base != remote_hash && base != local_hash => {
                result.conflicts.insert(path);
            }
            Some(base) if base == remote_hash => {
                result.to_upload.insert(path);
            }
            _ => {
                result.to_download.insert(path);
            }
        }
    }

    for path in remote.paths() {
        if local.contains(path) {
            continue;
        }
        if state.local_index.contains(path) {
            result.to_delete.insert(path.to_string());
        } else {
            result.to_download.insert(path.to_string());
        }
    }

    result
}
