//! Transport to the agent: retrying HTTP client, throttle and progress.

pub mod client;
pub mod progress;
pub mod progress_stream;
pub mod throttle;

pub use client::{DownloadedFile, RetryPolicy, TransportClient};
pub use progress::{ProgressReporter, ProgressTracker, TransferProgress};
