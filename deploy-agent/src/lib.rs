//! Deploy Agent Library
//!
//! HTTP file-operations agent: every request is authenticated, checked
//! against the IP allow-list and rate limited before a path-guarded file
//! operation runs against the project root.

pub mod api;
pub mod config;
pub mod daemon;
pub mod extract;
pub mod fsutil;
pub mod gateway;
pub mod maintenance;
pub mod ops;
pub mod security;
pub mod trash;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use gateway::Gateway;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
