//! Sliding-window request limiter shared across agent processes.
//!
//! Each client's window lives in `<state>/ratelimit/<key>.json`. The
//! read-evict-append-write cycle holds that file's exclusive lock, so two
//! concurrent requests can never both observe a stale count.
//!
//! Windows whose every timestamp has expired are swept at most once per
//! window length. Checks hold a shared lock on the directory and the sweep
//! holds it exclusively, so no request is mid-cycle on a file being removed.

use crate::Result;
use chrono::Utc;
use deploy_core::lock::{lock_path_for, read_json_or_default, update_json, ExclusiveLock, SharedLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

pub const WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindow {
    pub client_id: String,
    /// Request times in unix milliseconds, oldest first
    pub timestamps: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Limited { retry_after_secs: u64 },
}

#[derive(Debug)]
pub struct RateLimiter {
    dir: PathBuf,
    limit: usize,
    last_sweep_ms: AtomicI64,
}

impl RateLimiter {
    /// `limit` requests per 60 seconds per client; 0 disables limiting.
    pub fn new(state_dir: &Path, limit: usize) -> Self {
        Self {
            dir: state_dir.join("ratelimit"),
            limit,
            last_sweep_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn check(&self, client_id: &str) -> Result<RateDecision> {
        self.check_at(client_id, Utc::now().timestamp_millis())
    }

    /// Record a request at `now_ms` unless the window is already full.
    pub fn check_at(&self, client_id: &str, now_ms: i64) -> Result<RateDecision> {
        if self.limit == 0 {
            return Ok(RateDecision::Allowed { remaining: usize::MAX });
        }

        let limit = self.limit;
        let path = self.window_path(client_id);
        let dir_lock = SharedLock::acquire(&self.dir_lock_path())?;
        let decision = update_json(&path, |window: &mut RateWindow| {
            window.client_id = client_id.to_string();
            window.timestamps.retain(|&t| now_ms - t < WINDOW_MS);

            if window.timestamps.len() >= limit {
                let oldest = window.timestamps.first().copied().unwrap_or(now_ms);
                let wait_ms = (oldest + WINDOW_MS - now_ms).max(0) as u64;
                let retry_after_secs = wait_ms.div_ceil(1000).clamp(1, 60);
                RateDecision::Limited { retry_after_secs }
            } else {
                window.timestamps.push(now_ms);
                RateDecision::Allowed {
                    remaining: limit - window.timestamps.len(),
                }
            }
        })?;
        drop(dir_lock);

        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) >= WINDOW_MS
            && self
                .last_sweep_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            if let Err(e) = self.sweep_at(now_ms) {
                warn!("Failed to sweep rate windows: {}", e);
            }
        }
        Ok(decision)
    }

    /// Delete windows with no request inside the last `WINDOW_MS`.
    /// Returns how many were removed.
    pub fn sweep_at(&self, now_ms: i64) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let _dir_lock = ExclusiveLock::acquire(&self.dir_lock_path())?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let window: RateWindow = match read_json_or_default(&path) {
                Ok(window) => window,
                Err(e) => {
                    warn!("Unreadable rate window {}: {}", path.display(), e);
                    RateWindow::default()
                }
            };
            if window.timestamps.iter().any(|&t| now_ms - t < WINDOW_MS) {
                continue;
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove rate window {}: {}", path.display(), e);
                continue;
            }
            let _ = fs::remove_file(lock_path_for(&path));
            removed += 1;
        }
        if removed > 0 {
            debug!("Swept {} expired rate windows", removed);
        }
        Ok(removed)
    }

    fn dir_lock_path(&self) -> PathBuf {
        self.dir.join(".sweep.lock")
    }

    fn window_path(&self, client_id: &str) -> PathBuf {
        let key: String = client_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .take(128)
            .collect();
        self.dir.join(format!("{key}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_sixth_request_limited_then_recovers() {
        let dir = TempDir::new().unwrap();
        let limiter = RateLimiter::new(dir.path(), 5);
        let start = 1_700_000_000_000;

        for i in 0..5 {
            let decision = limiter.check_at("203.0.113.9", start + i * 1000).unwrap();
            assert!(matches!(decision, RateDecision::Allowed { .. }));
        }

        match limiter.check_at("203.0.113.9", start + 5_000).unwrap() {
            RateDecision::Limited { retry_after_secs } => {
                assert!(retry_after_secs <= 60);
                assert_eq!(retry_after_secs, 55);
            }
            other => panic!("expected limit, got {other:?}"),
        }

        let later = limiter.check_at("203.0.113.9", start + 61_000).unwrap();
        assert!(matches!(later, RateDecision::Allowed { .. }));
    }

    #[test]
    fn test_clients_are_independent() {
        let dir = TempDir::new().unwrap();
        let limiter = RateLimiter::new(dir.path(), 1);
        let now = 1_700_000_000_000;

        assert!(matches!(
            limiter.check_at("a", now).unwrap(),
            RateDecision::Allowed { remaining: 0 }
        ));
        assert!(matches!(limiter.check_at("a", now).unwrap(), RateDecision::Limited { .. }));
        assert!(matches!(limiter.check_at("b", now).unwrap(), RateDecision::Allowed { .. }));
    }

    #[test]
    fn test_zero_limit_disables() {
        let dir = TempDir::new().unwrap();
        let limiter = RateLimiter::new(dir.path(), 0);
        for _ in 0..100 {
            assert!(matches!(limiter.check("x").unwrap(), RateDecision::Allowed { .. }));
        }
        assert!(!dir.path().join("ratelimit").exists());
    }

    #[test]
    fn test_concurrent_requests_never_exceed_limit() {
        let dir = TempDir::new().unwrap();
        let limiter = Arc::new(RateLimiter::new(dir.path(), 10));
        let now = 1_700_000_000_000;

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.check_at("shared", now).unwrap())
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|d| matches!(d, RateDecision::Allowed { .. }))
            .count();
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_key_is_sanitized() {
        let dir = TempDir::new().unwrap();
        let limiter = RateLimiter::new(dir.path(), 3);
        limiter.check("../../etc/passwd").unwrap();
        assert!(dir.path().join("ratelimit/.._.._etc_passwd.json").exists());
    }

    #[test]
    fn test_expired_windows_are_swept() {
        let dir = TempDir::new().unwrap();
        let limiter = RateLimiter::new(dir.path(), 5);
        let start = 1_700_000_000_000;

        limiter.check_at("198.51.100.1", start).unwrap();
        limiter.check_at("198.51.100.2", start + 30_000).unwrap();
        let windows = dir.path().join("ratelimit");
        assert!(windows.join("198.51.100.1.json").exists());

        // A request a full window later sweeps the idle client but keeps its own
        limiter.check_at("198.51.100.3", start + 70_000).unwrap();
        assert!(!windows.join("198.51.100.1.json").exists());
        assert!(!windows.join("198.51.100.1.json.lock").exists());
        assert!(windows.join("198.51.100.2.json").exists());
        assert!(windows.join("198.51.100.3.json").exists());

        assert_eq!(limiter.sweep_at(start + 200_000).unwrap(), 2);
        assert!(matches!(
            limiter.check_at("198.51.100.2", start + 200_000).unwrap(),
            RateDecision::Allowed { remaining: 4 }
        ));
    }
}
