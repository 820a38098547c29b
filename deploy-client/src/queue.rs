//! Failed transfers carried over to the next run.

use chrono::{DateTime, Utc};
use deploy_core::lock::{read_json_or_default, update_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const QUEUE_FILE: &str = "queue.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Upload,
    Download,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub kind: OperationKind,
    pub path: String,
    pub last_error: String,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    operations: Vec<QueuedOperation>,
}

/// `<root>/.deploy/queue.json`, one entry per (kind, path).
#[derive(Debug, Clone)]
pub struct OperationQueue {
    path: PathBuf,
}

impl OperationQueue {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(QUEUE_FILE),
        }
    }

    pub fn list(&self) -> deploy_core::Result<Vec<QueuedOperation>> {
        let file: QueueFile = read_json_or_default(&self.path)?;
        Ok(file.operations)
    }

    /// Queued paths of one kind, oldest first.
    pub fn pending(&self, kind: OperationKind) -> deploy_core::Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|op| op.kind == kind)
            .map(|op| op.path)
            .collect())
    }

    pub fn record_failure(
        &self,
        kind: OperationKind,
        path: &str,
        error: &str,
    ) -> deploy_core::Result<()> {
        update_json(&self.path, |file: &mut QueueFile| {
            match file
                .operations
                .iter_mut()
                .find(|op| op.kind == kind && op.path == path)
            {
                Some(op) => {
                    op.attempts += 1;
                    op.last_error = error.to_string();
                }
                None => file.operations.push(QueuedOperation {
                    kind,
                    path: path.to_string(),
                    last_error: error.to_string(),
                    attempts: 1,
                    queued_at: Utc::now(),
                }),
            }
        })
    }

    /// Drop the entry for (kind, path). Returns whether one existed.
    pub fn clear(&self, kind: OperationKind, path: &str) -> deploy_core::Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        update_json(&self.path, |file: &mut QueueFile| {
            let before = file.operations.len();
            file.operations
                .retain(|op| !(op.kind == kind && op.path == path));
            file.operations.len() != before
        })
    }
}
