//! File operations executed by the gateway after admission.
//!
//! Every operation resolves its path arguments through the gateway's
//! `PathGuard` before touching the filesystem.

pub mod admin;
pub mod files;
pub mod query;

use chrono::{DateTime, Utc};
use std::time::SystemTime;

pub(crate) fn to_datetime(time: Option<SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_default()
}

#[cfg(unix)]
pub(crate) fn mode_string(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub(crate) fn mode_string(meta: &std::fs::Metadata) -> String {
    if meta.permissions().readonly() { "444" } else { "644" }.to_string()
}
