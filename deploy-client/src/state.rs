//! Persisted record of the last state both sides agreed on.

use chrono::{DateTime, Utc};
use deploy_core::lock::{read_json_or_default, write_json_atomic};
use deploy_core::{FileIndex, FileRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "sync-state.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Local files as of the last acknowledged transfer; doubles as the
    /// scanner's hash cache
    #[serde(default)]
    pub local_index: FileIndex,

    /// Remote path → hash as last confirmed by the agent
    #[serde(default)]
    pub last_known_remote: BTreeMap<String, String>,

    #[serde(default)]
    pub last_push: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_pull: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_sync_completed: bool,
}

impl SyncState {
    /// Both sides now hold `record`; the agent confirmed it.
    pub fn record_agreed(&mut self, record: FileRecord) {
        self.last_known_remote
            .insert(record.path.clone(), record.hash.clone());
        self.local_index.insert(record);
    }

    /// The path is gone from both sides.
    pub fn record_removed(&mut self, path: &str) {
        self.last_known_remote.remove(path);
        self.local_index.remove(path);
    }

    /// Drop every tracked path that neither side holds any more, so a file
    /// later created under the same name is treated as new. Returns the
    /// dropped paths.
    pub fn forget_vanished(&mut self, local: &FileIndex, remote: &FileIndex) -> Vec<String> {
        let vanished: Vec<String> = self
            .local_index
            .paths()
            .chain(self.last_known_remote.keys().map(String::as_str))
            .filter(|path| !local.contains(path) && !remote.contains(path))
            .map(str::to_string)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for path in &vanished {
            self.record_removed(path);
        }
        vanished
    }

    pub fn last_known_remote_hash(&self, path: &str) -> Option<&str> {
        self.last_known_remote.get(path).map(String::as_str)
    }
}

/// Owns `<root>/.deploy/sync-state.json`.
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    path: PathBuf,
}

impl SyncStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored state, or an empty one before the first sync.
    pub fn load(&self) -> deploy_core::Result<SyncState> {
        read_json_or_default(&self.path)
    }

    pub fn save(&self, state: &SyncState) -> deploy_core::Result<()> {
        write_json_atomic(&self.path, state)
    }
}
