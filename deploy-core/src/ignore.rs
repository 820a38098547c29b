//! Ignore matching shared by every tree walker.
//!
//! One predicate decides what the scanner, the backup manager and the agent's
//! listing/tree operations skip. Patterns use a gitignore-like dialect:
//!
//! - `name` or `*.log` matches any single path segment
//! - `dir/sub` (a slash inside) is anchored at the root and also matches
//!   everything below it
//! - `**` inside an anchored pattern matches any number of segments
//! - a trailing `/` restricts the pattern to directories and their contents
//! - `!pattern` re-includes a previously ignored path
//! - blank lines and `#` comments are skipped

use std::path::Path;

/// Project-level ignore file read by the client and the agent.
pub const IGNORE_FILE: &str = ".deployignore";

/// Secondary ignore source merged after [`IGNORE_FILE`].
pub const GIT_IGNORE_FILE: &str = ".gitignore";

/// Names that are never synced: tool state and VCS internals.
const RESERVED: &[&str] = &[crate::STATE_DIR, ".git", ".DS_Store"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    segments: Vec<String>,
    anchored: bool,
    dir_only: bool,
    negated: bool,
}

impl Pattern {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let body = body.replace('\\', "/");
        let dir_only = body.ends_with('/');
        let trimmed = body.trim_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let anchored = trimmed.contains('/') || body.starts_with('/');
        let segments = trimmed
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if segments.is_empty() {
            return None;
        }
        Some(Self {
            segments,
            anchored,
            dir_only,
            negated,
        })
    }

    fn matches(&self, path: &[&str], is_dir: bool) -> bool {
        if self.anchored {
            // Any prefix of the path that matches ignores the whole subtree.
            (1..=path.len()).any(|len| {
                let prefix_is_dir = len < path.len() || is_dir;
                (!self.dir_only || prefix_is_dir) && match_segments(&self.segments, &path[..len])
            })
        } else {
            let pattern = &self.segments[0];
            path.iter().enumerate().any(|(idx, segment)| {
                let segment_is_dir = idx + 1 < path.len() || is_dir;
                (!self.dir_only || segment_is_dir) && wildcard_match(pattern, segment)
            })
        }
    }
}

/// Composable ignore predicate.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    patterns: Vec<Pattern>,
}

impl IgnoreMatcher {
    /// Matcher with only the reserved names.
    pub fn new() -> Self {
        let mut matcher = Self::default();
        for name in RESERVED {
            matcher.add(name);
        }
        matcher
    }

    /// Matcher with the reserved names plus the given patterns.
    pub fn with_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::new();
        for pattern in patterns {
            matcher.add(pattern.as_ref());
        }
        matcher
    }

    /// Matcher for a project root: reserved names, then `.deployignore`,
    /// then `.gitignore`, then `extra`.
    pub fn for_root(root: &Path, extra: &[String]) -> Self {
        let mut matcher = Self::new();
        for file in [IGNORE_FILE, GIT_IGNORE_FILE] {
            if let Ok(contents) = std::fs::read_to_string(root.join(file)) {
                for line in contents.lines() {
                    matcher.add(line);
                }
            }
        }
        for pattern in extra {
            matcher.add(pattern);
        }
        matcher
    }

    /// Add one pattern line. Comments and blanks are ignored.
    pub fn add(&mut self, line: &str) {
        if let Some(pattern) = Pattern::parse(line) {
            self.patterns.push(pattern);
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Decide whether a POSIX relative path is ignored.
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        let normalized = relative_path.replace('\\', "/");
        let segments = normalized
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect::<Vec<_>>();
        if segments.is_empty() {
            return false;
        }

        let mut ignored = false;
        for pattern in &self.patterns {
            if pattern.negated == ignored && pattern.matches(&segments, is_dir) {
                ignored = !pattern.negated;
            }
        }
        ignored
    }

    /// Same as [`is_ignored`](Self::is_ignored) for a filesystem path under `root`.
    pub fn is_path_ignored(&self, root: &Path, path: &Path, is_dir: bool) -> bool {
        match path.strip_prefix(root) {
            Ok(rel) => self.is_ignored(&crate::paths::to_posix(rel), is_dir),
            Err(_) => false,
        }
    }
}

fn match_segments(pattern: &[String], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((first, rest)) if first == "**" => {
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some((first, rest)) => match path.split_first() {
            Some((segment, path_rest)) => {
                wildcard_match(first, segment) && match_segments(rest, path_rest)
            }
            None => false,
        },
    }
}

/// `*` and `?` wildcard match within a single segment.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(star_idx) = star {
            p = star_idx + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
