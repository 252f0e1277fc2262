//! HTTP middleware: api-key authentication and rate limiting.

pub mod auth;
pub mod rate_limit;

pub use auth::require_auth;
pub use rate_limit::RateLimiter;
