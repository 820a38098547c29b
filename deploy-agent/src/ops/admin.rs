//! Trash, archive, maintenance and backup operations.

use crate::gateway::Gateway;
use crate::{AgentError, Result};
use deploy_core::protocol::{
    BackupResponse, BackupSummary, BackupsResponse, BatchResponse, EmptyTrashResponse,
    ExtractResponse, LockResponse, RestoreTrashResponse, TrashEntry, TrashListResponse,
};
use tracing::info;

/// Soft-delete a batch of paths, continuing past failures.
pub fn trash(gw: &Gateway, paths: &[String]) -> BatchResponse<TrashEntry> {
    let mut batch = BatchResponse::default();
    for path in paths {
        let result = gw
            .guard
            .resolve_entry(path)
            .and_then(|target| gw.trash.trash(&target));
        match result {
            Ok(entry) => batch.push_ok(entry),
            Err(e) => batch.push_err(path, e),
        }
    }
    batch
}

pub fn list_trash(gw: &Gateway) -> Result<TrashListResponse> {
    Ok(TrashListResponse {
        entries: gw.trash.list()?,
    })
}

/// A forced restore backs up whatever currently occupies the original path.
pub fn restore_trash(gw: &Gateway, id: &str, force: bool) -> Result<RestoreTrashResponse> {
    let backup_id = if force {
        let original = gw
            .trash
            .list()?
            .into_iter()
            .find(|e| e.id == id)
            .map(|e| e.original_path)
            .ok_or_else(|| AgentError::NotFound(format!("trash entry {id}")))?;
        gw.backup_before(&[original], "trash restore")?
    } else {
        None
    };

    let entry = gw.trash.restore(id, force, &gw.guard)?;
    Ok(RestoreTrashResponse {
        id: entry.id,
        path: entry.original_path,
        backup_id,
    })
}

pub fn empty_trash(gw: &Gateway) -> Result<EmptyTrashResponse> {
    Ok(EmptyTrashResponse {
        removed: gw.trash.empty()?,
    })
}

/// Extract next to the archive unless a destination is given.
pub fn extract(
    gw: &Gateway,
    path: &str,
    destination: Option<&str>,
    overwrite: bool,
) -> Result<ExtractResponse> {
    let archive = gw.guard.resolve_entry(path)?;
    let destination = match destination {
        Some(dest) => gw.guard.resolve(dest)?,
        None => gw.guard.resolve(deploy_core::paths::parent_of(&archive.relative))?,
    };
    if destination.absolute.is_file() {
        return Err(AgentError::Conflict(format!(
            "destination {} is a file",
            destination.relative
        )));
    }

    let mut backup_id = None;
    let summary = gw
        .extractor
        .extract_with(&archive, &destination, overwrite, &gw.guard, |replaced| {
            backup_id = gw.backup_before(replaced, "extract")?;
            Ok(())
        })?;
    Ok(ExtractResponse {
        destination: destination.relative,
        files: summary.files,
        directories: summary.directories,
        bytes: summary.bytes,
        backup_id,
    })
}

pub fn lock(gw: &Gateway, message: Option<String>) -> Result<LockResponse> {
    let state = gw.maintenance.lock(message)?;
    info!("Maintenance mode enabled");
    Ok(LockResponse {
        locked: true,
        message: state.message,
    })
}

pub fn unlock(gw: &Gateway) -> Result<LockResponse> {
    let was_locked = gw.maintenance.unlock()?;
    if was_locked {
        info!("Maintenance mode disabled");
    }
    Ok(LockResponse {
        locked: false,
        message: None,
    })
}

/// On-demand backup of the whole tree or of the given paths.
pub fn backup(
    gw: &Gateway,
    paths: Option<&[String]>,
    description: Option<String>,
) -> Result<BackupResponse> {
    let scope = match paths {
        Some(paths) => {
            let mut scope = Vec::with_capacity(paths.len());
            for path in paths {
                let target = gw.guard.resolve_entry(path)?;
                if !target.absolute.exists() {
                    return Err(AgentError::NotFound(target.relative));
                }
                scope.push(target.relative);
            }
            Some(scope)
        }
        None => None,
    };

    let manifest = gw.create_backup(scope.as_deref(), description)?;
    Ok(BackupResponse {
        backup: BackupSummary::from(&manifest),
    })
}

pub fn backups(gw: &Gateway) -> Result<BackupsResponse> {
    let backups = gw.backups.list()?.iter().map(BackupSummary::from).collect();
    Ok(BackupsResponse { backups })
}

/// Replay a backup; every manifest path must still pass the path guard.
/// Files about to be replaced are backed up first.
pub fn restore(gw: &Gateway, id: &str, paths: Option<&[String]>) -> Result<BatchResponse<String>> {
    let manifest = gw.backups.get(id)?;
    for path in manifest.files.paths() {
        gw.guard.resolve_entry(path)?;
    }
    let only = match paths {
        Some(paths) => Some(
            paths
                .iter()
                .map(|p| gw.guard.resolve_entry(p).map(|r| r.relative))
                .collect::<Result<Vec<_>>>()?,
        ),
        None => None,
    };

    let replaced: Vec<String> = manifest
        .files
        .paths()
        .filter(|path| match &only {
            Some(only) => only.iter().any(|o| deploy_core::paths::is_within(path, o)),
            None => true,
        })
        .map(|path| path.to_string())
        .collect();
    gw.backup_before(&replaced, "backup restore")?;

    let report = gw.backups.restore(id, only.as_deref())?;
    let mut batch = BatchResponse::default();
    for path in report.restored {
        batch.push_ok(path);
    }
    for failure in report.failed {
        batch.push_err(failure.path, failure.error);
    }
    Ok(batch)
}

pub fn delete_backup(gw: &Gateway, id: &str) -> Result<()> {
    gw.backups.delete(id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::gateway;
    use std::fs;

    #[test]
    fn test_trash_batch_reports_failures() {
        let (dir, gw) = gateway();
        fs::write(dir.path().join("old.css"), b"a").unwrap();

        let batch = trash(
            &gw,
            &["old.css".into(), "missing.css".into(), "../etc/passwd".into()],
        );
        assert_eq!(batch.succeeded, 1);
        assert_eq!(batch.failed, 2);
        assert_eq!(list_trash(&gw).unwrap().entries.len(), 1);

        let id = batch.items[0].id.clone();
        let restored = restore_trash(&gw, &id, false).unwrap();
        assert_eq!(restored.path, "old.css");
        assert!(dir.path().join("old.css").exists());
        assert_eq!(empty_trash(&gw).unwrap().removed, 0);
    }

    #[test]
    fn test_backup_restore_cycle() {
        let (dir, gw) = gateway();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/main.php"), b"v1").unwrap();
        fs::write(dir.path().join("readme.md"), b"docs").unwrap();

        let created = backup(&gw, None, Some("before release".into())).unwrap();
        assert_eq!(created.backup.file_count, 2);

        fs::write(dir.path().join("app/main.php"), b"v2").unwrap();
        fs::remove_file(dir.path().join("readme.md")).unwrap();

        let report = restore(&gw, &created.backup.id, Some(&["app".into()])).unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(fs::read(dir.path().join("app/main.php")).unwrap(), b"v1");
        assert!(!dir.path().join("readme.md").exists());

        // The replaced app/main.php was snapshotted before the restore
        let listed = backups(&gw).unwrap();
        assert_eq!(listed.backups.len(), 2);
        let automatic = listed
            .backups
            .iter()
            .find(|b| b.id != created.backup.id)
            .unwrap();
        assert_eq!(automatic.file_count, 1);
        assert_eq!(
            automatic.description.as_deref(),
            Some("automatic backup before backup restore")
        );

        delete_backup(&gw, &created.backup.id).unwrap();
        assert_eq!(backups(&gw).unwrap().backups.len(), 1);
        assert!(matches!(
            delete_backup(&gw, &created.backup.id),
            Err(AgentError::NotFound(_))
        ));
    }

    #[test]
    fn test_backups_follow_current_ignore_rules() {
        let (dir, gw) = gateway();
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        fs::write(dir.path().join("cache/page.html"), b"cached").unwrap();
        fs::write(dir.path().join("index.php"), b"<?php").unwrap();
        fs::write(dir.path().join(".deployignore"), b"cache/\n").unwrap();

        let created = backup(&gw, None, None).unwrap();
        let manifest = gw.backups.get(&created.backup.id).unwrap();
        assert!(manifest.files.contains("index.php"));
        assert!(!manifest.files.contains("cache/page.html"));
        assert!(!dir
            .path()
            .join(".deploy/backups")
            .join(&created.backup.id)
            .join("files/cache")
            .exists());
    }

    #[test]
    fn test_scoped_backup_requires_existing_paths() {
        let (_dir, gw) = gateway();
        assert!(matches!(
            backup(&gw, Some(&["nope".into()]), None),
            Err(AgentError::NotFound(_))
        ));
    }

    #[test]
    fn test_extract_defaults_to_archive_directory() {
        let (dir, gw) = gateway();
        fs::create_dir_all(dir.path().join("uploads")).unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, "hello.txt", &b"hello"[..])
            .unwrap();
        fs::write(dir.path().join("uploads/pkg.tar"), builder.into_inner().unwrap()).unwrap();

        let response = extract(&gw, "uploads/pkg.tar", None, false).unwrap();
        assert_eq!(response.destination, "uploads");
        assert_eq!(response.files, 1);
        assert_eq!(fs::read(dir.path().join("uploads/hello.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_forced_trash_restore_backs_up_occupant() {
        let (dir, gw) = gateway();
        fs::write(dir.path().join("index.php"), b"trashed").unwrap();
        let id = trash(&gw, &["index.php".into()]).items[0].id.clone();
        fs::write(dir.path().join("index.php"), b"replacement").unwrap();

        assert!(matches!(
            restore_trash(&gw, &id, false),
            Err(AgentError::Conflict(_))
        ));
        assert!(backups(&gw).unwrap().backups.is_empty());

        let restored = restore_trash(&gw, &id, true).unwrap();
        let backup_id = restored.backup_id.unwrap();
        assert_eq!(fs::read(dir.path().join("index.php")).unwrap(), b"trashed");

        fs::remove_file(dir.path().join("index.php")).unwrap();
        restore(&gw, &backup_id, None).unwrap();
        assert_eq!(fs::read(dir.path().join("index.php")).unwrap(), b"replacement");
    }

    #[test]
    fn test_overwriting_extract_backs_up_replaced_files() {
        let (dir, gw) = gateway();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, "config.php", &b"new"[..]).unwrap();
        fs::write(dir.path().join("release.tar"), builder.into_inner().unwrap()).unwrap();
        fs::write(dir.path().join("config.php"), b"old").unwrap();

        let response = extract(&gw, "release.tar", None, true).unwrap();
        assert_eq!(fs::read(dir.path().join("config.php")).unwrap(), b"new");
        let backup_id = response.backup_id.unwrap();

        let manifest = gw.backups.get(&backup_id).unwrap();
        assert_eq!(manifest.files.paths().collect::<Vec<_>>(), vec!["config.php"]);
        restore(&gw, &backup_id, None).unwrap();
        assert_eq!(fs::read(dir.path().join("config.php")).unwrap(), b"old");
    }
}
