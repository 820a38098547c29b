//! Request admission: token, IP allow-list, rate limiting and path containment.

pub mod auth;
pub mod guard;
pub mod ip;
pub mod rate_limit;

pub use guard::{PathGuard, ResolvedPath};
pub use rate_limit::{RateDecision, RateLimiter};
