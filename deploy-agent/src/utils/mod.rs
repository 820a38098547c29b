//! Utility modules for the deploy agent.

pub mod errors;
pub mod logger;

pub use errors::{AgentError, Result};
