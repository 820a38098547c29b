//! Filesystem helpers shared by the trash, move and extract operations.

use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Move a file or directory, falling back to copy + remove across filesystems.
pub fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Err(e) = fs::rename(from, to) {
        tracing::debug!(
            "rename {} -> {} failed ({}), copying instead",
            from.display(),
            to.display(),
            e
        );
        copy_path(from, to)?;
        remove_path(from)?;
    }
    Ok(())
}

/// Copy a file or a whole directory tree. Symlinks are recreated, not followed.
pub fn copy_path(from: &Path, to: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(from)?;
    if !meta.is_dir() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        return copy_entry(from, to, &meta);
    }

    let mut copied = 0;
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(relative);
        let meta = entry.metadata().map_err(io::Error::other)?;
        if meta.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copied += copy_entry(entry.path(), &target, &meta)?;
        }
    }
    Ok(copied)
}

fn copy_entry(from: &Path, to: &Path, meta: &fs::Metadata) -> io::Result<u64> {
    #[cfg(unix)]
    if meta.file_type().is_symlink() {
        let target = fs::read_link(from)?;
        std::os::unix::fs::symlink(target, to)?;
        return Ok(0);
    }
    let _ = meta;
    fs::copy(from, to)
}

/// Remove a file, symlink or directory tree.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Remove empty directories from `start` upward, stopping at `stop`.
pub fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Replace `path` with `bytes` through a sibling temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    let tmp = temp_sibling(path);
    if let Err(e) = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Hidden temp path next to `path`, unique per call.
pub fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{name}.{}.part",
        uuid::Uuid::new_v4().simple()
    ))
}

/// True if the entry exists, dangling symlinks included.
pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_and_move_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"aaa").unwrap();
        fs::write(src.join("nested/b.txt"), b"bb").unwrap();

        let copied = copy_path(&src, &dir.path().join("copy")).unwrap();
        assert_eq!(copied, 5);
        assert_eq!(fs::read(dir.path().join("copy/nested/b.txt")).unwrap(), b"bb");

        move_path(&src, &dir.path().join("moved/here")).unwrap();
        assert!(!src.exists());
        assert!(dir.path().join("moved/here/a.txt").exists());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("deep/file.txt");
        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path().join("deep")).unwrap().count(), 1);
    }

    #[test]
    fn test_prune_empty_dirs_stops_at_boundary() {
        let dir = TempDir::new().unwrap();
        let deep = dir.path().join("a/b/c");
        fs::create_dir_all(&deep).unwrap();
        fs::write(dir.path().join("a/keep.txt"), b"k").unwrap();

        prune_empty_dirs(&deep, dir.path());
        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a").exists());
    }
}
