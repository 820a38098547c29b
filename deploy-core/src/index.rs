//! File records and indexes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One tracked file: POSIX relative path, content hash, size and mtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    /// Hex SHA-256 of the file bytes
    pub hash: String,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch
    pub mtime: i64,
}

/// Mapping of relative path to [`FileRecord`].
///
/// Built fresh by every scan; only [`set_hash`](Self::set_hash) and
/// [`remove`](Self::remove) mutate an existing index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileIndex {
    files: BTreeMap<String, FileRecord>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I: IntoIterator<Item = FileRecord>>(records: I) -> Self {
        let mut index = Self::new();
        for record in records {
            index.insert(record);
        }
        index
    }

    /// Insert or replace the record for its path.
    pub fn insert(&mut self, record: FileRecord) {
        self.files.insert(record.path.clone(), record);
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(|r| r.hash.as_str())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Replace the hash of an existing record. Returns false if absent.
    pub fn set_hash(&mut self, path: &str, hash: impl Into<String>) -> bool {
        match self.files.get_mut(path) {
            Some(record) => {
                record.hash = hash.into();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.files.remove(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Path → hash view, the shape exchanged by the `list` operation.
    pub fn hashes(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(path, record)| (path.clone(), record.hash.clone()))
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|r| r.size).sum()
    }
}

impl FromIterator<FileRecord> for FileIndex {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        Self::from_records(iter)
    }
}
