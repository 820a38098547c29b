//! Batch progress: files done, bytes moved, speed and ETA.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot handed to progress reporters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    pub total_files: usize,
    pub files_done: usize,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub current_file: Option<String>,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.files_done >= self.total_files { 100.0 } else { 0.0 };
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

/// Receives a snapshot per progress tick and per finished file.
pub type ProgressReporter = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Tracks one push or pull batch.
pub struct ProgressTracker {
    started: Instant,
    last_tick: Instant,
    last_bytes: u64,
    /// Bytes of files already finished
    settled_bytes: u64,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_tick: now,
            last_bytes: 0,
            settled_bytes: 0,
            progress: TransferProgress {
                total_files,
                total_bytes,
                ..TransferProgress::default()
            },
        }
    }

    pub fn start_file(&mut self, path: &str) {
        self.progress.current_file = Some(path.to_string());
    }

    /// `bytes` of the current file have moved.
    pub fn file_bytes(&mut self, bytes: u64) -> &TransferProgress {
        self.tick(self.settled_bytes + bytes)
    }

    /// The current file is finished (or abandoned) after `size` bytes.
    pub fn finish_file(&mut self, size: u64) -> &TransferProgress {
        self.settled_bytes += size;
        self.progress.files_done += 1;
        self.progress.current_file = None;
        self.tick(self.settled_bytes)
    }

    fn tick(&mut self, transferred: u64) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64();
        if elapsed > 0.0 {
            let delta = transferred.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (delta as f64 / elapsed) as u64;
        }

        let speed = self.progress.bytes_per_second.max(self.average_speed());
        if speed > 0 {
            let remaining = self.progress.total_bytes.saturating_sub(transferred);
            self.progress.eta_seconds = remaining / speed;
        }

        self.progress.transferred_bytes = transferred;
        self.last_tick = now;
        self.last_bytes = transferred;
        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.progress.transferred_bytes as f64 / secs) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    match seconds {
        0..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m {}s", seconds / 60, seconds % 60),
        _ => format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_files_and_bytes_accumulate() {
        let mut tracker = ProgressTracker::new(2, 1000);
        tracker.start_file("a.php");
        assert_eq!(tracker.file_bytes(300).transferred_bytes, 300);
        assert_eq!(tracker.progress().current_file.as_deref(), Some("a.php"));

        let snapshot = tracker.finish_file(400).clone();
        assert_eq!(snapshot.files_done, 1);
        assert_eq!(snapshot.transferred_bytes, 400);
        assert!(snapshot.current_file.is_none());

        tracker.start_file("b.php");
        assert_eq!(tracker.file_bytes(100).transferred_bytes, 500);
        assert!((tracker.progress().percent() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_speed_and_eta() {
        let mut tracker = ProgressTracker::new(1, 10_000);
        tracker.start_file("big.bin");
        thread::sleep(Duration::from_millis(50));
        let snapshot = tracker.file_bytes(5_000);
        assert!(snapshot.bytes_per_second > 0);
        assert!(snapshot.eta_seconds < 60);
    }

    #[test]
    fn test_empty_batch_percent() {
        let mut tracker = ProgressTracker::new(1, 0);
        assert_eq!(tracker.progress().percent(), 0.0);
        tracker.finish_file(0);
        assert_eq!(tracker.progress().percent(), 100.0);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_speed(2048), "2.0 KiB/s");
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7260), "2h 1m");
    }
}
