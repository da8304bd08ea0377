//! Middleware for observability and rate limiting.
//!
//! This module provides:
//! - Request logging with latency tracking
//! - Per-identity, per-category rate limiting

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{
    enforce_quota, Admission, QuotaGuard, QuotaKey, QuotaPolicy, RateLimitCategory,
    RateLimitPolicies, RateLimiter,
};
