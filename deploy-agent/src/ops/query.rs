//! Read-only inspection: search, grep, stats, logs, tree and watch.

use crate::gateway::Gateway;
use crate::{AgentError, Result};
use chrono::{DateTime, Utc};
use deploy_core::ignore::{wildcard_match, IgnoreMatcher};
use deploy_core::protocol::{
    DiskStats, EntryKind, GrepMatch, GrepResponse, LogsResponse, SearchResponse, StatsResponse,
    TreeNode, TreeResponse, TypeStats, WatchChange, WatchResponse,
};
use deploy_core::walker::{walk_dirs, walk_files, walk_files_with_callback};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use walkdir::WalkDir;

const DEFAULT_SEARCH_LIMIT: usize = 200;
const DEFAULT_GREP_LIMIT: usize = 100;
const MAX_RESULTS: usize = 5000;
const MAX_CONTEXT: usize = 10;
const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 5000;
const LOG_TAIL_BYTES: u64 = 4 * 1024 * 1024;
const DEFAULT_TREE_DEPTH: usize = 3;
const MAX_TREE_DEPTH: usize = 12;
const GREP_MAX_FILE: u64 = 10 * 1024 * 1024;

/// Join a walk-relative path onto the base it was walked from.
fn under(base: &str, relative: &str) -> String {
    if base.is_empty() {
        relative.to_string()
    } else {
        format!("{base}/{relative}")
    }
}

/// Glob over entry names; a pattern containing `/` matches the whole path.
/// Patterns without wildcards match as substrings.
pub fn search(
    gw: &Gateway,
    pattern: &str,
    path: Option<&str>,
    limit: Option<usize>,
) -> Result<SearchResponse> {
    if pattern.trim().is_empty() {
        return Err(AgentError::BadRequest("pattern must not be empty".into()));
    }
    let base = gw.guard.resolve(path.unwrap_or(""))?;
    if !base.absolute.is_dir() {
        return Err(AgentError::NotFound(base.relative));
    }

    let pattern = pattern.to_lowercase();
    let glob = if pattern.contains(['*', '?']) {
        pattern.clone()
    } else {
        format!("*{pattern}*")
    };
    let whole_path = pattern.contains('/');
    let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_RESULTS);
    let matcher = gw.matcher();
    let root = gw.root();

    let mut matches = Vec::new();
    let mut truncated = false;
    let entries = WalkDir::new(&base.absolute)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !matcher.is_path_ignored(root, e.path(), e.file_type().is_dir()));

    for entry in entries.flatten() {
        let Some(relative) = gw.guard.relative(entry.path()) else {
            continue;
        };
        let subject = if whole_path {
            relative.to_lowercase()
        } else {
            entry.file_name().to_string_lossy().to_lowercase()
        };
        if wildcard_match(&glob, &subject) {
            if matches.len() == limit {
                truncated = true;
                break;
            }
            matches.push(relative);
        }
    }

    Ok(SearchResponse { matches, truncated })
}

/// Line search with optional surrounding context.
pub fn grep(
    gw: &Gateway,
    query: &str,
    path: Option<&str>,
    context: usize,
    ignore_case: bool,
    limit: Option<usize>,
) -> Result<GrepResponse> {
    if query.is_empty() {
        return Err(AgentError::BadRequest("query must not be empty".into()));
    }
    let base = gw.guard.resolve(path.unwrap_or(""))?;
    let context = context.min(MAX_CONTEXT);
    let limit = limit.unwrap_or(DEFAULT_GREP_LIMIT).clamp(1, MAX_RESULTS);
    let needle = if ignore_case { query.to_lowercase() } else { query.to_string() };

    let candidates = if base.absolute.is_file() {
        vec![(base.relative.clone(), base.absolute.clone())]
    } else if base.absolute.is_dir() {
        walk_files(&base.absolute, &gw.matcher(), &gw.walk_options())?
            .into_iter()
            .filter(|f| f.size <= GREP_MAX_FILE)
            .map(|f| (under(&base.relative, &f.relative_path), f.path))
            .collect()
    } else {
        return Err(AgentError::NotFound(base.relative));
    };

    let mut matches = Vec::new();
    for (relative, absolute) in candidates {
        let Ok(bytes) = fs::read(&absolute) else {
            continue;
        };
        if bytes.iter().take(8192).any(|b| *b == 0) {
            continue;
        }
        let Ok(text) = String::from_utf8(bytes) else {
            continue;
        };

        let lines: Vec<&str> = text.lines().collect();
        for (idx, line) in lines.iter().enumerate() {
            let hit = if ignore_case {
                line.to_lowercase().contains(&needle)
            } else {
                line.contains(&needle)
            };
            if !hit {
                continue;
            }
            if matches.len() == limit {
                return Ok(GrepResponse { matches, truncated: true });
            }
            let before_start = idx.saturating_sub(context);
            let after_end = (idx + 1 + context).min(lines.len());
            matches.push(GrepMatch {
                path: relative.clone(),
                line: idx + 1,
                text: line.to_string(),
                before: lines[before_start..idx].iter().map(|s| s.to_string()).collect(),
                after: lines[idx + 1..after_end].iter().map(|s| s.to_string()).collect(),
            });
        }
    }

    Ok(GrepResponse { matches, truncated: false })
}

/// Total and free bytes of the filesystem holding `path`.
#[cfg(unix)]
pub fn disk_stats(path: &Path) -> Option<DiskStats> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let fragment = stat.fragment_size() as u64;
    Some(DiskStats {
        total_bytes: stat.blocks() as u64 * fragment,
        free_bytes: stat.blocks_available() as u64 * fragment,
    })
}

#[cfg(not(unix))]
pub fn disk_stats(_path: &Path) -> Option<DiskStats> {
    None
}

pub fn stats(gw: &Gateway) -> Result<StatsResponse> {
    let matcher = gw.matcher();
    let options = gw.walk_options();
    let mut types: BTreeMap<String, TypeStats> = BTreeMap::new();
    let mut total_files = 0;
    let mut total_size = 0;

    walk_files_with_callback(gw.root(), &matcher, &options, |file| {
        total_files += 1;
        total_size += file.size;
        let extension = Path::new(&file.relative_path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let entry = types.entry(extension).or_default();
        entry.count += 1;
        entry.size += file.size;
    })?;
    let total_dirs = walk_dirs(gw.root(), &matcher, &options)?.len();

    Ok(StatsResponse {
        total_files,
        total_dirs,
        total_size,
        disk: disk_stats(gw.root()),
        types,
    })
}

/// Tail the agent's log file, optionally keeping only lines containing `filter`.
pub fn logs(gw: &Gateway, lines: Option<usize>, filter: Option<&str>) -> Result<LogsResponse> {
    let path = gw
        .config
        .log
        .file
        .as_ref()
        .ok_or_else(|| AgentError::NotFound("no log file configured".into()))?;
    let wanted = lines.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);

    let mut file = File::open(path).map_err(|e| AgentError::from_io(e, "log file"))?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(LOG_TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut tail = VecDeque::with_capacity(wanted);
    // A mid-file start may cut the first line.
    for line in text.lines().skip(usize::from(start > 0)) {
        if filter.is_some_and(|f| !line.contains(f)) {
            continue;
        }
        if tail.len() == wanted {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    Ok(LogsResponse {
        lines: tail.into_iter().collect(),
    })
}

pub fn tree(gw: &Gateway, path: Option<&str>, depth: Option<usize>) -> Result<TreeResponse> {
    let base = gw.guard.resolve(path.unwrap_or(""))?;
    if !base.absolute.exists() {
        return Err(AgentError::NotFound(base.relative));
    }
    let depth = depth.unwrap_or(DEFAULT_TREE_DEPTH).min(MAX_TREE_DEPTH);
    let name = if base.is_root() {
        ".".to_string()
    } else {
        base.absolute
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let tree = build_node(gw.root(), &base.absolute, name, depth, &gw.matcher())?;
    Ok(TreeResponse { tree })
}

fn build_node(
    root: &Path,
    path: &Path,
    name: String,
    depth: usize,
    matcher: &IgnoreMatcher,
) -> Result<TreeNode> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(TreeNode { name, kind: EntryKind::Symlink, size: None, children: Vec::new() });
    }
    if !meta.is_dir() {
        let kind = if meta.is_file() { EntryKind::File } else { EntryKind::Other };
        return Ok(TreeNode { name, kind, size: Some(meta.len()), children: Vec::new() });
    }

    let mut children = Vec::new();
    if depth > 0 {
        let mut entries: Vec<_> = fs::read_dir(path)?.flatten().collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if matcher.is_path_ignored(root, &entry.path(), is_dir) {
                continue;
            }
            let child_name = entry.file_name().to_string_lossy().into_owned();
            children.push(build_node(root, &entry.path(), child_name, depth - 1, matcher)?);
        }
        children.sort_by_key(|c| c.kind != EntryKind::Directory);
    }

    Ok(TreeNode { name, kind: EntryKind::Directory, size: None, children })
}

/// Files modified after `since`, oldest change first.
pub fn watch(gw: &Gateway, since: DateTime<Utc>) -> Result<WatchResponse> {
    let threshold = since.timestamp_millis();
    let mut changes = Vec::new();
    walk_files_with_callback(gw.root(), &gw.matcher(), &gw.walk_options(), |file| {
        if file.mtime > threshold {
            changes.push(WatchChange {
                path: file.relative_path,
                size: file.size,
                modified: DateTime::from_timestamp_millis(file.mtime).unwrap_or_default(),
            });
        }
    })?;
    changes.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(WatchResponse { since, changes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::gateway;
    use chrono::Duration;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("src/views")).unwrap();
        fs::create_dir_all(root.join("assets")).unwrap();
        fs::write(root.join("index.php"), "<?php\nrequire 'src/app.php';\n").unwrap();
        fs::write(root.join("src/app.php"), "<?php\n// TODO: route\nfunction route() {}\n").unwrap();
        fs::write(root.join("src/views/home.html"), "<h1>Home</h1>\n").unwrap();
        fs::write(root.join("assets/logo.PNG"), [0u8, 1, 2, 3]).unwrap();
    }

    #[test]
    fn test_search_by_name_and_path() {
        let (dir, gw) = gateway();
        populate(dir.path());

        let found = search(&gw, "*.php", None, None).unwrap();
        assert_eq!(found.matches, vec!["index.php", "src/app.php"]);

        let found = search(&gw, "views", None, None).unwrap();
        assert_eq!(found.matches, vec!["src/views"]);

        let found = search(&gw, "src/*/*.html", None, None).unwrap();
        assert_eq!(found.matches, vec!["src/views/home.html"]);

        let found = search(&gw, "*.png", Some("assets"), Some(5)).unwrap();
        assert_eq!(found.matches, vec!["assets/logo.PNG"]);
        assert!(!found.truncated);

        let limited = search(&gw, "*", None, Some(1)).unwrap();
        assert!(limited.truncated);
    }

    #[test]
    fn test_grep_with_context_and_case() {
        let (dir, gw) = gateway();
        populate(dir.path());

        let hits = grep(&gw, "todo", None, 1, true, None).unwrap();
        assert_eq!(hits.matches.len(), 1);
        let hit = &hits.matches[0];
        assert_eq!(hit.path, "src/app.php");
        assert_eq!(hit.line, 2);
        assert_eq!(hit.before, vec!["<?php"]);
        assert_eq!(hit.after, vec!["function route() {}"]);

        assert!(grep(&gw, "todo", None, 0, false, None).unwrap().matches.is_empty());

        let scoped = grep(&gw, "<?php", Some("src"), 0, false, None).unwrap();
        assert_eq!(scoped.matches.len(), 1);
        assert_eq!(scoped.matches[0].path, "src/app.php");
    }

    #[test]
    #[cfg(unix)]
    fn test_grep_and_stats_ignore_links_out_of_root() {
        let (dir, gw) = gateway();
        populate(dir.path());
        let outside = tempfile::TempDir::new().unwrap();
        fs::write(outside.path().join("wp-config.php"), "define('DB_PASSWORD', 'hunter2');\n").unwrap();
        std::os::unix::fs::symlink(outside.path().join("wp-config.php"), dir.path().join("config.php")).unwrap();

        let hits = grep(&gw, "DB_PASSWORD", None, 0, false, None).unwrap();
        assert!(hits.matches.is_empty());
        assert!(grep(&gw, "DB_PASSWORD", Some("config.php"), 0, false, None).is_err());
        assert_eq!(stats(&gw).unwrap().total_files, 4);
    }

    #[test]
    fn test_stats_histogram() {
        let (dir, gw) = gateway();
        populate(dir.path());

        let stats = stats(&gw).unwrap();
        assert_eq!(stats.total_files, 4);
        assert_eq!(stats.total_dirs, 3);
        assert_eq!(stats.types["php"].count, 2);
        assert_eq!(stats.types["png"].size, 4);
    }

    #[test]
    fn test_tree_depth_and_order() {
        let (dir, gw) = gateway();
        populate(dir.path());

        let tree = tree(&gw, None, Some(1)).unwrap().tree;
        let names: Vec<_> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["assets", "src", "index.php"]);
        assert!(tree.children[1].children.is_empty());

        let deep = tree_of(&gw, "src");
        assert_eq!(deep.children[0].name, "views");
        assert_eq!(deep.children[0].children[0].name, "home.html");
    }

    fn tree_of(gw: &Gateway, path: &str) -> TreeNode {
        tree(gw, Some(path), None).unwrap().tree
    }

    #[test]
    fn test_watch_since() {
        let (dir, gw) = gateway();
        populate(dir.path());

        let recent = watch(&gw, Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(recent.changes.len(), 4);
        let future = watch(&gw, Utc::now() + Duration::hours(1)).unwrap();
        assert!(future.changes.is_empty());
    }

    #[test]
    fn test_logs_tail_and_filter() {
        let dir = tempfile::TempDir::new().unwrap();
        let log_path = dir.path().join("agent.log");
        fs::write(&log_path, "INFO start\nWARN disk\nINFO list\nERROR boom\n").unwrap();
        let mut config = crate::Config::for_root(dir.path(), crate::gateway::tests::TOKEN);
        config.log.file = Some(log_path);
        let gw = Gateway::new(config).unwrap();

        let tail = logs(&gw, Some(2), None).unwrap();
        assert_eq!(tail.lines, vec!["INFO list", "ERROR boom"]);
        let infos = logs(&gw, None, Some("INFO")).unwrap();
        assert_eq!(infos.lines, vec!["INFO start", "INFO list"]);

        let (_other, no_log) = gateway();
        assert!(matches!(logs(&no_log, None, None), Err(AgentError::NotFound(_))));
    }
}
