//! Local tree scanning with an mtime-keyed hash cache.

use deploy_core::hash::hash_file;
use deploy_core::ignore::IgnoreMatcher;
use deploy_core::walker::{walk_files_with_callback, WalkOptions};
use deploy_core::{FileIndex, FileRecord};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cache effectiveness of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files: usize,
    pub cache_hits: usize,
    pub hashed: usize,
}

#[derive(Debug, Clone)]
pub struct LocalScanner {
    root: PathBuf,
    matcher: IgnoreMatcher,
}

impl LocalScanner {
    /// Scanner for `root` honoring `.deployignore`, `.gitignore` and `extra`.
    pub fn new(root: impl Into<PathBuf>, extra: &[String]) -> Self {
        let root = root.into();
        let matcher = IgnoreMatcher::for_root(&root, extra);
        Self { root, matcher }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn matcher(&self) -> &IgnoreMatcher {
        &self.matcher
    }

    /// Build a fresh index. A file whose mtime and size match its record in
    /// `previous` keeps the cached hash; anything else is rehashed.
    pub fn scan(&self, previous: &FileIndex) -> deploy_core::Result<(FileIndex, ScanStats)> {
        let mut index = FileIndex::new();
        let mut stats = ScanStats::default();
        let mut failure = None;

        let options = WalkOptions::default();
        walk_files_with_callback(&self.root, &self.matcher, &options, |info| {
            if failure.is_some() {
                return;
            }
            stats.files += 1;

            let cached = previous
                .get(&info.relative_path)
                .filter(|record| record.mtime == info.mtime && record.size == info.size)
                .map(|record| record.hash.clone());
            let hash = match cached {
                Some(hash) => {
                    stats.cache_hits += 1;
                    hash
                }
                None => match hash_file(&info.path) {
                    Ok(hash) => {
                        stats.hashed += 1;
                        hash
                    }
                    Err(e) => {
                        failure = Some(e);
                        return;
                    }
                },
            };

            index.insert(FileRecord {
                path: info.relative_path,
                hash,
                size: info.size,
                mtime: info.mtime,
            });
        })?;

        if let Some(e) = failure {
            return Err(e.into());
        }

        debug!(
            "Scanned {}: {} files, {} cached, {} hashed",
            self.root.display(),
            stats.files,
            stats.cache_hits,
            stats.hashed
        );
        Ok((index, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::hash::hash_bytes;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".deploy")).unwrap();
        std::fs::write(dir.path().join("index.php"), b"<?php").unwrap();
        std::fs::write(dir.path().join("src/app.js"), b"console.log(1)").unwrap();
        std::fs::write(dir.path().join(".deploy/sync-state.json"), b"{}").unwrap();
        dir
    }

    #[test]
    fn test_scan_skips_state_dir_and_ignored() {
        let dir = project();
        std::fs::write(dir.path().join("debug.log"), b"noise").unwrap();
        let scanner = LocalScanner::new(dir.path(), &["*.log".to_string()]);

        let (index, stats) = scanner.scan(&FileIndex::new()).unwrap();
        let paths: Vec<_> = index.paths().collect();
        assert_eq!(paths, vec!["index.php", "src/app.js"]);
        assert_eq!(stats.hashed, 2);
        assert_eq!(index.hash_of("index.php"), Some(hash_bytes(b"<?php").as_str()));
    }

    #[test]
    fn test_cache_reuses_hash_for_same_mtime() {
        let dir = project();
        let scanner = LocalScanner::new(dir.path(), &[]);
        let (first, _) = scanner.scan(&FileIndex::new()).unwrap();

        // A poisoned cached hash proves the cache was used
        let mut previous = first.clone();
        previous.set_hash("index.php", "cached");
        let (second, stats) = scanner.scan(&previous).unwrap();

        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.hashed, 0);
        assert_eq!(second.hash_of("index.php"), Some("cached"));
    }

    #[test]
    fn test_cache_miss_on_changed_mtime() {
        let dir = project();
        let scanner = LocalScanner::new(dir.path(), &[]);
        let (first, _) = scanner.scan(&FileIndex::new()).unwrap();

        let mut previous = first.clone();
        let mut record = previous.get("index.php").unwrap().clone();
        record.mtime -= 10_000;
        record.hash = "stale".into();
        previous.insert(record);

        let (second, stats) = scanner.scan(&previous).unwrap();
        assert_eq!(stats.hashed, 1);
        assert_eq!(second.hash_of("index.php"), first.hash_of("index.php"));
    }
}
