//! Deploy Client Library
//!
//! Keeps a local project tree and a remote one (reachable only through the
//! deploy agent) in step: scan, list, three-way diff, then verified
//! one-at-a-time transfers with the agreed state recorded after each.

pub mod config;
pub mod diff;
pub mod error;
pub mod logger;
pub mod queue;
pub mod scanner;
pub mod state;
pub mod sync;
pub mod transfer;

// Re-export commonly used types
pub use config::ClientConfig;
pub use diff::{ConflictPolicy, DiffResult};
pub use error::{BatchReport, ClientError, Result};
pub use sync::{SyncEngine, SyncOptions, SyncReport};
pub use transfer::TransportClient;
