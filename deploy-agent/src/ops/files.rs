//! Tree listing and single-path file operations.

use super::{mode_string, to_datetime};
use crate::fsutil::{copy_path, exists, move_path, remove_path, write_atomic};
use crate::gateway::Gateway;
use crate::{AgentError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use deploy_core::hash::{hash_bytes, hash_file};
use deploy_core::paths::parent_of;
use deploy_core::protocol::{
    BatchResponse, ChmodResponse, DeleteResponse, EditResponse, Encoding, EntryKind, InfoResponse,
    ListResponse, MoveItem, MoveMode, MovedItem, PathResponse, ReadResponse, WriteResponse,
};
use deploy_core::walker::walk_files_with_callback;
use deploy_core::{FileIndex, FileRecord};
use std::fs::{self, OpenOptions};
use std::io::Write;
use tracing::{debug, info, warn};

/// Path → hash map of the whole tracked tree.
pub fn list(gw: &Gateway) -> Result<ListResponse> {
    let matcher = gw.matcher();
    let mut index = FileIndex::new();
    let mut failures = 0usize;

    walk_files_with_callback(gw.root(), &matcher, &gw.walk_options(), |file| {
        match hash_file(&file.path) {
            Ok(hash) => index.insert(FileRecord {
                path: file.relative_path,
                hash,
                size: file.size,
                mtime: file.mtime,
            }),
            Err(e) => {
                failures += 1;
                warn!("Skipping unreadable file {}: {}", file.relative_path, e);
            }
        }
    })?;

    debug!("Listed {} files ({} unreadable)", index.len(), failures);
    Ok(ListResponse {
        count: index.len(),
        files: index,
    })
}

pub fn delete(gw: &Gateway, path: &str, permanent: bool) -> Result<DeleteResponse> {
    let target = gw.guard.resolve_entry(path)?;
    if !exists(&target.absolute) {
        return Err(AgentError::NotFound(target.relative));
    }

    let backup_id = gw.backup_before(std::slice::from_ref(&target.relative), "delete")?;

    let trash_id = if permanent {
        remove_path(&target.absolute).map_err(|e| AgentError::from_io(e, &target.relative))?;
        info!(path = %target.relative, "Deleted permanently");
        None
    } else {
        Some(gw.trash.trash(&target)?.id)
    };

    Ok(DeleteResponse {
        path: target.relative,
        trash_id,
        backup_id,
    })
}

pub fn move_items(
    gw: &Gateway,
    items: &[MoveItem],
    mode: MoveMode,
    overwrite: bool,
) -> BatchResponse<MovedItem> {
    let mut batch = BatchResponse::default();
    for item in items {
        match move_one(gw, item, mode, overwrite) {
            Ok(moved) => batch.push_ok(moved),
            Err(e) => batch.push_err(&item.from, e),
        }
    }
    batch
}

fn move_one(gw: &Gateway, item: &MoveItem, mode: MoveMode, overwrite: bool) -> Result<MovedItem> {
    let from = gw.guard.resolve_entry(&item.from)?;
    let to = gw.guard.resolve_entry(&item.to)?;

    if !exists(&from.absolute) {
        return Err(AgentError::NotFound(from.relative));
    }
    if from.relative == to.relative {
        return Err(AgentError::BadRequest("source and destination are the same".into()));
    }
    if to.relative.starts_with(&format!("{}/", from.relative)) {
        return Err(AgentError::BadRequest(format!(
            "cannot place {} inside itself",
            from.relative
        )));
    }

    if exists(&to.absolute) {
        if !overwrite {
            return Err(AgentError::Conflict(format!("{} already exists", to.relative)));
        }
        gw.backup_before(std::slice::from_ref(&to.relative), "overwrite")?;
        remove_path(&to.absolute).map_err(|e| AgentError::from_io(e, &to.relative))?;
    }

    match mode {
        MoveMode::Move => move_path(&from.absolute, &to.absolute),
        MoveMode::Copy => copy_path(&from.absolute, &to.absolute).map(|_| ()),
    }
    .map_err(|e| AgentError::from_io(e, &from.relative))?;

    info!(from = %from.relative, to = %to.relative, ?mode, "Moved");
    Ok(MovedItem {
        from: from.relative,
        to: to.relative,
    })
}

/// Replace `find` with `replace` in the final name segment of each path.
pub fn rename(
    gw: &Gateway,
    paths: &[String],
    find: &str,
    replace: &str,
) -> Result<BatchResponse<MovedItem>> {
    if find.is_empty() {
        return Err(AgentError::BadRequest("find must not be empty".into()));
    }

    let mut batch = BatchResponse::default();
    for path in paths {
        match rename_one(gw, path, find, replace) {
            Ok(moved) => batch.push_ok(moved),
            Err(e) => batch.push_err(path, e),
        }
    }
    Ok(batch)
}

fn rename_one(gw: &Gateway, path: &str, find: &str, replace: &str) -> Result<MovedItem> {
    let from = gw.guard.resolve_entry(path)?;
    if !exists(&from.absolute) {
        return Err(AgentError::NotFound(from.relative));
    }

    let parent = parent_of(&from.relative);
    let name = &from.relative[if parent.is_empty() { 0 } else { parent.len() + 1 }..];
    if !name.contains(find) {
        return Err(AgentError::BadRequest(format!("{name} does not contain {find}")));
    }
    let new_name = name.replace(find, replace);
    if new_name.is_empty() || new_name == "." || new_name == ".." || new_name.contains(['/', '\\']) {
        return Err(AgentError::BadRequest(format!("invalid new name: {new_name}")));
    }

    let target_path = if parent.is_empty() {
        new_name
    } else {
        format!("{parent}/{new_name}")
    };
    let to = gw.guard.resolve_entry(&target_path)?;
    if exists(&to.absolute) {
        return Err(AgentError::Conflict(format!("{} already exists", to.relative)));
    }

    fs::rename(&from.absolute, &to.absolute).map_err(|e| AgentError::from_io(e, &from.relative))?;
    Ok(MovedItem {
        from: from.relative,
        to: to.relative,
    })
}

pub fn mkdir(gw: &Gateway, path: &str) -> Result<PathResponse> {
    let target = gw.guard.resolve_entry(path)?;
    if target.absolute.exists() && !target.absolute.is_dir() {
        return Err(AgentError::Conflict(format!("{} is a file", target.relative)));
    }
    fs::create_dir_all(&target.absolute)?;
    Ok(PathResponse {
        path: target.relative,
    })
}

pub fn touch(gw: &Gateway, path: &str) -> Result<PathResponse> {
    let target = gw.guard.resolve_entry(path)?;
    if target.absolute.is_dir() {
        return Err(AgentError::Conflict(format!("{} is a directory", target.relative)));
    }
    if let Some(parent) = target.absolute.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&target.absolute)?;
    file.set_modified(std::time::SystemTime::now())?;
    Ok(PathResponse {
        path: target.relative,
    })
}

fn decode(content: &str, encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Plain => Ok(content.as_bytes().to_vec()),
        Encoding::Base64 => BASE64
            .decode(content.trim())
            .map_err(|e| AgentError::BadRequest(format!("invalid base64 content: {e}"))),
    }
}

pub fn write(
    gw: &Gateway,
    path: &str,
    content: &str,
    encoding: Encoding,
    append: bool,
) -> Result<WriteResponse> {
    let target = gw.guard.resolve_entry(path)?;
    let bytes = decode(content, encoding)?;
    if target.absolute.is_dir() {
        return Err(AgentError::Conflict(format!("{} is a directory", target.relative)));
    }

    let existing_size = fs::metadata(&target.absolute).map(|m| m.len()).unwrap_or(0);
    let final_size = if append { existing_size + bytes.len() as u64 } else { bytes.len() as u64 };
    let max = gw.config.security.max_file_size;
    if final_size > max {
        return Err(AgentError::PayloadTooLarge(format!(
            "{} would be {final_size} bytes (max {max})",
            target.relative
        )));
    }

    let backup_id = gw.backup_before(std::slice::from_ref(&target.relative), "write")?;

    if append {
        if let Some(parent) = target.absolute.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target.absolute)?;
        file.write_all(&bytes)?;
    } else {
        write_atomic(&target.absolute, &bytes)?;
    }

    let hash = hash_file(&target.absolute)?;
    info!(path = %target.relative, size = final_size, append, "Wrote file");
    Ok(WriteResponse {
        path: target.relative,
        hash,
        size: final_size,
        backup_id,
    })
}

pub fn read(
    gw: &Gateway,
    path: &str,
    encoding: Encoding,
    offset: Option<usize>,
    lines: Option<usize>,
) -> Result<ReadResponse> {
    let target = gw.guard.resolve_entry(path)?;
    let meta = fs::metadata(&target.absolute).map_err(|e| AgentError::from_io(e, &target.relative))?;
    if !meta.is_file() {
        return Err(AgentError::BadRequest(format!("{} is not a file", target.relative)));
    }
    let max = gw.config.security.max_file_size;
    if meta.len() > max {
        return Err(AgentError::PayloadTooLarge(format!(
            "{} is {} bytes (max {max}); use download",
            target.relative,
            meta.len()
        )));
    }

    let bytes = fs::read(&target.absolute)?;
    let hash = hash_bytes(&bytes);
    let size = bytes.len() as u64;
    let partial = offset.is_some() || lines.is_some();

    let (content, total_lines) = match encoding {
        Encoding::Base64 if partial => {
            return Err(AgentError::BadRequest(
                "offset and lines apply to plain reads only".into(),
            ))
        }
        Encoding::Base64 => (BASE64.encode(&bytes), None),
        Encoding::Plain => {
            let text = String::from_utf8(bytes).map_err(|_| {
                AgentError::BadRequest(format!(
                    "{} is not valid UTF-8; read it as base64",
                    target.relative
                ))
            })?;
            if partial {
                let all: Vec<&str> = text.lines().collect();
                let start = offset.unwrap_or(0).min(all.len());
                let end = lines.map(|n| start.saturating_add(n).min(all.len())).unwrap_or(all.len());
                (all[start..end].join("\n"), Some(all.len()))
            } else {
                (text, None)
            }
        }
    };

    Ok(ReadResponse {
        path: target.relative,
        content,
        encoding,
        hash,
        size,
        total_lines,
    })
}

pub fn edit(gw: &Gateway, path: &str, find: &str, replace: &str, all: bool) -> Result<EditResponse> {
    if find.is_empty() {
        return Err(AgentError::BadRequest("find must not be empty".into()));
    }
    let target = gw.guard.resolve_entry(path)?;
    let bytes = fs::read(&target.absolute).map_err(|e| AgentError::from_io(e, &target.relative))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| AgentError::BadRequest(format!("{} is not valid UTF-8", target.relative)))?;

    let occurrences = text.matches(find).count();
    if occurrences == 0 {
        return Err(AgentError::BadRequest(format!(
            "search text not found in {}",
            target.relative
        )));
    }
    let (updated, replacements) = if all {
        (text.replace(find, replace), occurrences)
    } else {
        (text.replacen(find, replace, 1), 1)
    };
    let max = gw.config.security.max_file_size;
    if updated.len() as u64 > max {
        return Err(AgentError::PayloadTooLarge(format!(
            "{} would exceed {max} bytes",
            target.relative
        )));
    }

    let backup_id = gw.backup_before(std::slice::from_ref(&target.relative), "edit")?;
    write_atomic(&target.absolute, updated.as_bytes())?;

    info!(path = %target.relative, replacements, "Edited file");
    Ok(EditResponse {
        path: target.relative,
        replacements,
        hash: hash_bytes(updated.as_bytes()),
        backup_id,
    })
}

/// Parse `"755"`, `"0644"` or `"0o600"`.
pub fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    let value = u32::from_str_radix(digits, 8)
        .map_err(|_| AgentError::BadRequest(format!("invalid octal mode: {mode}")))?;
    if digits.is_empty() || value > 0o7777 {
        return Err(AgentError::BadRequest(format!("invalid octal mode: {mode}")));
    }
    Ok(value)
}

#[cfg(unix)]
pub fn chmod(gw: &Gateway, path: &str, mode: &str, recursive: bool) -> Result<ChmodResponse> {
    use std::os::unix::fs::PermissionsExt;

    let bits = parse_mode(mode)?;
    let target = gw.guard.resolve(path)?;
    if !target.absolute.exists() {
        return Err(AgentError::NotFound(target.relative));
    }

    let mut changed = 0;
    let walker = walkdir::WalkDir::new(&target.absolute)
        .follow_links(false)
        .max_depth(if recursive { usize::MAX } else { 0 });
    for entry in walker {
        let entry = entry.map_err(|e| AgentError::Internal(e.to_string()))?;
        if entry.path_is_symlink() {
            continue;
        }
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(bits))?;
        changed += 1;
    }

    info!(path = %target.relative, mode = %format!("{bits:o}"), changed, "Changed mode");
    Ok(ChmodResponse {
        path: target.relative,
        mode: format!("{bits:o}"),
        changed,
    })
}

#[cfg(not(unix))]
pub fn chmod(_gw: &Gateway, _path: &str, mode: &str, _recursive: bool) -> Result<ChmodResponse> {
    parse_mode(mode)?;
    Err(AgentError::BadRequest("chmod is only supported on unix hosts".into()))
}

pub fn info(gw: &Gateway, path: &str) -> Result<InfoResponse> {
    let target = gw.guard.resolve(path)?;
    let meta = fs::symlink_metadata(&target.absolute)
        .map_err(|e| AgentError::from_io(e, &target.relative))?;

    let kind = if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if meta.is_dir() {
        EntryKind::Directory
    } else if meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    let hash = if kind == EntryKind::File && meta.len() <= gw.config.security.max_file_size {
        Some(hash_file(&target.absolute)?)
    } else {
        None
    };

    Ok(InfoResponse {
        path: target.relative,
        kind,
        size: meta.len(),
        mode: mode_string(&meta),
        modified: to_datetime(meta.modified().ok()),
        hash,
    })
}
