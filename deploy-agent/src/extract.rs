//! All-or-nothing archive extraction.
//!
//! The whole archive is validated before a single byte is written: entry
//! names, entry types, declared sizes and (without overwrite) collisions.
//! Extraction then re-reads the archive and streams each file to disk.

use crate::security::{PathGuard, ResolvedPath};
use crate::{AgentError, Result};
use deploy_core::paths::{has_traversal, normalize_relative};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::EntryType;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
}

impl ArchiveFormat {
    pub fn detect(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlannedKind {
    File,
    Directory,
}

/// One validated entry, in archive order.
#[derive(Debug, Clone)]
struct PlannedEntry {
    target: PathBuf,
    relative: String,
    kind: PlannedKind,
    replaces_existing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    max_file_size: u64,
}

impl ArchiveExtractor {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    pub fn extract(
        &self,
        archive: &ResolvedPath,
        destination: &ResolvedPath,
        overwrite: bool,
        guard: &PathGuard,
    ) -> Result<ExtractSummary> {
        self.extract_with(archive, destination, overwrite, guard, |_| Ok(()))
    }

    /// Like [`extract`](Self::extract), calling `before_write` with the
    /// existing files the archive will replace once validation has passed
    /// and before anything is written. An error from it aborts extraction.
    pub fn extract_with<F>(
        &self,
        archive: &ResolvedPath,
        destination: &ResolvedPath,
        overwrite: bool,
        guard: &PathGuard,
        before_write: F,
    ) -> Result<ExtractSummary>
    where
        F: FnOnce(&[String]) -> Result<()>,
    {
        let format = ArchiveFormat::detect(&archive.relative).ok_or_else(|| {
            AgentError::BadRequest(format!(
                "unsupported archive format: {} (expected .tar, .tar.gz or .tgz)",
                archive.relative
            ))
        })?;
        if !archive.absolute.is_file() {
            return Err(AgentError::NotFound(archive.relative.clone()));
        }

        let plan = self.validate(archive, format, destination, overwrite, guard)?;
        debug!("Archive {} validated ({} entries)", archive.relative, plan.len());

        let replaced: Vec<String> = plan
            .iter()
            .filter(|step| step.replaces_existing)
            .map(|step| step.relative.clone())
            .collect();
        before_write(&replaced)?;

        let summary = self.unpack(archive, format, &plan)?;
        info!(
            archive = %archive.relative,
            destination = %destination.relative,
            files = summary.files,
            bytes = summary.bytes,
            "Archive extracted"
        );
        Ok(summary)
    }

    fn open(&self, path: &Path, format: ArchiveFormat) -> Result<tar::Archive<Box<dyn Read>>> {
        let file = BufReader::new(File::open(path)?);
        let reader: Box<dyn Read> = match format {
            ArchiveFormat::Tar => Box::new(file),
            ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        };
        Ok(tar::Archive::new(reader))
    }

    fn validate(
        &self,
        archive: &ResolvedPath,
        format: ArchiveFormat,
        destination: &ResolvedPath,
        overwrite: bool,
        guard: &PathGuard,
    ) -> Result<Vec<PlannedEntry>> {
        let mut tar = self.open(&archive.absolute, format)?;
        let mut plan = Vec::new();

        for entry in tar.entries().map_err(corrupt)? {
            let entry = entry.map_err(corrupt)?;
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let name = check_entry_name(&raw)?;
            let Some(relative) = name else {
                continue;
            };

            let kind = match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    PlannedKind::File
                }
                EntryType::Directory => PlannedKind::Directory,
                EntryType::Symlink | EntryType::Link => {
                    return Err(AgentError::Forbidden(format!(
                        "archive entry {raw} is a link"
                    )))
                }
                EntryType::XGlobalHeader | EntryType::XHeader => continue,
                other => {
                    return Err(AgentError::BadRequest(format!(
                        "archive entry {raw} has unsupported type {other:?}"
                    )))
                }
            };

            let size = entry.header().size().map_err(corrupt)?;
            if kind == PlannedKind::File && size > self.max_file_size {
                return Err(AgentError::PayloadTooLarge(format!(
                    "archive entry {raw} is {size} bytes (max {})",
                    self.max_file_size
                )));
            }

            let joined = if destination.is_root() {
                relative
            } else {
                format!("{}/{}", destination.relative, relative)
            };
            let target = guard.resolve_entry(&joined)?;

            if kind == PlannedKind::File && !overwrite && target.absolute.exists() {
                return Err(AgentError::Conflict(format!(
                    "{} already exists; pass overwrite to replace it",
                    target.relative
                )));
            }
            if kind == PlannedKind::File && target.absolute.is_dir() {
                return Err(AgentError::Conflict(format!(
                    "{} is a directory",
                    target.relative
                )));
            }

            plan.push(PlannedEntry {
                replaces_existing: kind == PlannedKind::File && target.absolute.is_file(),
                target: target.absolute,
                relative: target.relative,
                kind,
            });
        }

        Ok(plan)
    }

    fn unpack(
        &self,
        archive: &ResolvedPath,
        format: ArchiveFormat,
        plan: &[PlannedEntry],
    ) -> Result<ExtractSummary> {
        let mut tar = self.open(&archive.absolute, format)?;
        let mut summary = ExtractSummary::default();
        let mut planned = plan.iter();

        for entry in tar.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            if check_entry_name(&raw)?.is_none()
                || matches!(
                    entry.header().entry_type(),
                    EntryType::XGlobalHeader | EntryType::XHeader
                )
            {
                continue;
            }
            let Some(step) = planned.next() else {
                return Err(AgentError::Internal("archive changed during extraction".into()));
            };

            match step.kind {
                PlannedKind::Directory => {
                    fs::create_dir_all(&step.target)?;
                    summary.directories += 1;
                }
                PlannedKind::File => {
                    if let Some(parent) = step.target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut out = File::create(&step.target)?;
                    summary.bytes += io::copy(&mut entry, &mut out)?;
                    summary.files += 1;
                }
            }
        }

        Ok(summary)
    }
}

/// `Ok(None)` for entries naming the archive root (`./`).
fn check_entry_name(raw: &str) -> Result<Option<String>> {
    let reject = |why: &str| Err(AgentError::Forbidden(format!("archive entry {raw}: {why}")));

    if raw.contains('\0') {
        return reject("null byte");
    }
    if raw.starts_with('/') || raw.starts_with('\\') {
        return reject("absolute path");
    }
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return reject("drive-letter path");
    }
    if has_traversal(raw) {
        return reject("path traversal");
    }
    Ok(normalize_relative(raw))
}

fn corrupt(e: io::Error) -> AgentError {
    AgentError::BadRequest(format!("unreadable archive: {e}"))
}
