//! Directory traversal filtered by the shared ignore predicate.

use crate::ignore::IgnoreMatcher;
use crate::paths::to_posix;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Canonical directory that symlink targets must stay inside.
    /// Links resolving elsewhere, and broken links, are skipped.
    pub confine_to: Option<PathBuf>,
}

impl WalkOptions {
    /// Default options with symlinks confined to `boundary`.
    pub fn confined(boundary: &Path) -> Self {
        Self {
            confine_to: Some(
                boundary
                    .canonicalize()
                    .unwrap_or_else(|_| boundary.to_path_buf()),
            ),
            ..Self::default()
        }
    }

    /// Whether `entry` resolves outside the boundary. Only symlinks, or
    /// anything reached through a followed link, can.
    fn escapes(&self, entry: &DirEntry) -> bool {
        let Some(boundary) = &self.confine_to else {
            return false;
        };
        if !entry.path_is_symlink() && !self.follow_links {
            return false;
        }
        match entry.path().canonicalize() {
            Ok(target) => !target.starts_with(boundary),
            Err(_) => true,
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// POSIX path relative to the walk root
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,

    /// Modification time in milliseconds since the Unix epoch
    pub mtime: i64,

    /// Is this a symlink?
    pub is_symlink: bool,

    /// File depth from root
    pub depth: usize,
}

impl FileInfo {
    /// Build from a DirEntry. Symlinks resolve to their target; symlinks to
    /// directories (e.g. a linked tool installation) and broken links yield None.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.path().symlink_metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = to_posix(path.strip_prefix(root).unwrap_or(&path));
        let is_symlink = raw_metadata.file_type().is_symlink();

        let metadata = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_dir() => return Ok(None),
                Ok(resolved) => resolved,
                Err(_) => return Ok(None),
            }
        } else {
            raw_metadata
        };

        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            mtime: mtime_millis(metadata.modified().ok()),
            is_symlink,
            depth: entry.depth(),
        }))
    }
}

/// Milliseconds since the Unix epoch, 0 when unknown.
pub fn mtime_millis(time: Option<SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn walker(root: &Path, options: &WalkOptions) -> WalkDir {
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }
    walker
}

/// Walk `root`, calling `callback` for every regular file the matcher keeps.
pub fn walk_files_with_callback<F>(
    root: &Path,
    matcher: &IgnoreMatcher,
    options: &WalkOptions,
    mut callback: F,
) -> crate::Result<()>
where
    F: FnMut(FileInfo),
{
    let entries = walker(root, options).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !(matcher.is_path_ignored(root, entry.path(), entry.file_type().is_dir())
                || options.escapes(entry))
    });

    for entry in entries {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Some(info) = FileInfo::from_entry(&entry, root)? {
            callback(info);
        }
    }
    Ok(())
}

/// Walk `root` and collect every kept regular file.
pub fn walk_files(
    root: &Path,
    matcher: &IgnoreMatcher,
    options: &WalkOptions,
) -> crate::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_files_with_callback(root, matcher, options, |info| files.push(info))?;
    Ok(files)
}

/// Kept directories (relative POSIX paths) below `root`, excluding the root.
pub fn walk_dirs(
    root: &Path,
    matcher: &IgnoreMatcher,
    options: &WalkOptions,
) -> crate::Result<Vec<String>> {
    let mut dirs = Vec::new();
    let entries = walker(root, options).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !(matcher.is_path_ignored(root, entry.path(), entry.file_type().is_dir())
                || options.escapes(entry))
    });
    for entry in entries {
        let entry = entry?;
        if entry.depth() > 0 && entry.file_type().is_dir() {
            dirs.push(to_posix(entry.path().strip_prefix(root).unwrap_or(entry.path())));
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_files(temp_dir.path(), &IgnoreMatcher::new(), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk_files(temp_dir.path(), &IgnoreMatcher::new(), &WalkOptions::default())?;
        let rel: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rel, vec!["file1.txt", "subdir/file2.txt"]);
        assert!(files.iter().all(|f| f.size == 8 && f.mtime > 0));
        Ok(())
    }

    #[test]
    fn test_ignored_directories_are_pruned() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join(".deploy/backups"))?;
        fs::create_dir_all(temp_dir.path().join("node_modules/pkg"))?;
        fs::write(temp_dir.path().join(".deploy/backups/x"), b"x")?;
        fs::write(temp_dir.path().join("node_modules/pkg/i.js"), b"x")?;
        fs::write(temp_dir.path().join("keep.txt"), b"x")?;

        let matcher = IgnoreMatcher::with_patterns(["node_modules/"]);
        let files = walk_files(temp_dir.path(), &matcher, &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "keep.txt");

        let dirs = walk_dirs(temp_dir.path(), &matcher, &WalkOptions::default())?;
        assert!(dirs.is_empty());
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinked_directory_is_skipped() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        let outside = TempDir::new()?;
        fs::write(outside.path().join("tool.bin"), b"x")?;
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("tool"))?;
        fs::write(temp_dir.path().join("a.txt"), b"a")?;

        let files = walk_files(temp_dir.path(), &IgnoreMatcher::new(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_confined_walk_skips_links_leaving_root() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        let outside = TempDir::new()?;
        fs::write(outside.path().join("secret.env"), b"DB_PASSWORD=x")?;
        fs::create_dir(temp_dir.path().join("shared"))?;
        fs::write(temp_dir.path().join("shared/real.txt"), b"real")?;
        std::os::unix::fs::symlink(outside.path().join("secret.env"), temp_dir.path().join("leak.env"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("shared/real.txt"), temp_dir.path().join("alias.txt"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("gone"), temp_dir.path().join("broken"))?;

        let open = walk_files(temp_dir.path(), &IgnoreMatcher::new(), &WalkOptions::default())?;
        assert!(open.iter().any(|f| f.relative_path == "leak.env"));

        let options = WalkOptions::confined(temp_dir.path());
        let files = walk_files(temp_dir.path(), &IgnoreMatcher::new(), &options)?;
        let rel: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rel, vec!["alias.txt", "shared/real.txt"]);
        assert!(files[0].is_symlink);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_followed_links_stay_confined() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        let outside = TempDir::new()?;
        fs::write(outside.path().join("tool.bin"), b"x")?;
        fs::create_dir(temp_dir.path().join("lib"))?;
        fs::write(temp_dir.path().join("lib/a.php"), b"a")?;
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("tool"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("lib"), temp_dir.path().join("vendor"))?;

        let options = WalkOptions {
            follow_links: true,
            ..WalkOptions::confined(temp_dir.path())
        };
        let files = walk_files(temp_dir.path(), &IgnoreMatcher::new(), &options)?;
        let rel: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rel, vec!["lib/a.php", "vendor/a.php"]);

        let dirs = walk_dirs(temp_dir.path(), &IgnoreMatcher::new(), &options)?;
        assert_eq!(dirs, vec!["lib", "vendor"]);
        Ok(())
    }
}
