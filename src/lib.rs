//! Finance Freedom Backend Library
//!
//! Account-security core: credential signing, refresh sessions, one-time
//! verification tokens, the authentication gate and the rate limiter.

pub mod auth;
pub mod clock;
pub mod config;
pub mod middleware;

pub use config::AppConfig;
