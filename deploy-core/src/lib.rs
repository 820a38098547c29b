//! Deploy Core Library
//!
//! Building blocks shared by the deploy agent and the deploy client:
//! content hashing, ignore matching, file indexes, backup snapshots and the
//! wire protocol both sides speak.

pub mod backup;
pub mod error;
pub mod hash;
pub mod ignore;
pub mod index;
pub mod lock;
pub mod paths;
pub mod protocol;
pub mod walker;

// Re-export commonly used types
pub use error::CoreError;
pub use index::{FileIndex, FileRecord};
pub type Result<T> = std::result::Result<T, CoreError>;

/// Hidden per-project directory reserved for the tool's own state.
pub const STATE_DIR: &str = ".deploy";
