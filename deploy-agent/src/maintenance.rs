//! Maintenance-mode flag file.

use crate::Result;
use chrono::{DateTime, Utc};
use deploy_core::lock::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceState {
    pub message: Option<String>,
    pub locked_at: DateTime<Utc>,
}

/// While `<state>/maintenance.json` exists, mutating operations are refused.
#[derive(Debug, Clone)]
pub struct MaintenanceFlag {
    path: PathBuf,
}

impl MaintenanceFlag {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("maintenance.json"),
        }
    }

    pub fn current(&self) -> Result<Option<MaintenanceState>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn lock(&self, message: Option<String>) -> Result<MaintenanceState> {
        let state = MaintenanceState {
            message,
            locked_at: Utc::now(),
        };
        write_json_atomic(&self.path, &state)?;
        Ok(state)
    }

    /// Returns whether a flag was present.
    pub fn unlock(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
