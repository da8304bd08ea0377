//! Runtime configuration
//!
//! Read from the process environment (after `.env` loading). Unparseable
//! values are logged and replaced by their defaults.

use crate::middleware::rate_limit::{QuotaPolicy, RateLimitCategory, RateLimitPolicies};
use chrono::Duration;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DB_FILE: &str = "finance_freedom_auth.db";
pub const DEFAULT_OBJECT_ROOT: &str = "data/objects";
pub const SIGNING_KEY_VAR: &str = "JWT_SECRET";
/// Used when `RUST_LOG` is unset; covers the binary and library targets
pub const DEFAULT_LOG_FILTER: &str =
    "finance_freedom=info,finance_freedom_backend=debug,tower_http=debug";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub auth_db_path: String,
    pub object_store_root: PathBuf,
    /// Origin the emailed forms post back to
    pub public_base_url: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub verification_ttl: Duration,
    pub bcrypt_cost: u32,
    /// How often idle buckets and expired tokens are swept
    pub prune_interval: std::time::Duration,
    pub rate_limits: RateLimitPolicies,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = parse_or(get("BIND_ADDR"), "BIND_ADDR", || {
            SocketAddr::from(([0, 0, 0, 0], 8080))
        });

        let access_ttl = Duration::seconds(parse_or(
            get("ACCESS_TOKEN_TTL_SECS"),
            "ACCESS_TOKEN_TTL_SECS",
            || 900,
        ));
        let mut refresh_ttl = Duration::seconds(parse_or(
            get("REFRESH_TOKEN_TTL_SECS"),
            "REFRESH_TOKEN_TTL_SECS",
            || 604_800,
        ));
        if refresh_ttl <= access_ttl {
            warn!(
                refresh_secs = refresh_ttl.num_seconds(),
                access_secs = access_ttl.num_seconds(),
                "Refresh TTL must exceed access TTL, using 7 days"
            );
            refresh_ttl = Duration::days(7);
        }
        let verification_ttl = Duration::seconds(parse_or(
            get("VERIFICATION_TOKEN_TTL_SECS"),
            "VERIFICATION_TOKEN_TTL_SECS",
            || 900,
        ));

        let mut rate_limits = RateLimitPolicies::default();
        for category in RateLimitCategory::ALL {
            let var = category.env_var();
            if let Some(raw) = get(&var) {
                match QuotaPolicy::parse(&raw) {
                    Some(policy) => rate_limits = rate_limits.with_override(category, policy),
                    None => warn!(var = %var, value = %raw, "Invalid quota override, using default"),
                }
            }
        }

        Self {
            bind_addr,
            auth_db_path: resolve_data_path(get("AUTH_DB_PATH"), DEFAULT_DB_FILE),
            object_store_root: PathBuf::from(resolve_data_path(
                get("OBJECT_STORE_ROOT"),
                DEFAULT_OBJECT_ROOT,
            )),
            public_base_url: get("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            access_ttl,
            refresh_ttl,
            verification_ttl,
            bcrypt_cost: parse_or(get("BCRYPT_COST"), "BCRYPT_COST", || bcrypt::DEFAULT_COST),
            prune_interval: std::time::Duration::from_secs(
                parse_or(get("RATE_LIMIT_PRUNE_SECS"), "RATE_LIMIT_PRUNE_SECS", || 300u64).max(1),
            ),
            rate_limits,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: impl FnOnce() -> T) -> T {
    match value {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Invalid config value, using default");
            default()
        }),
        None => default(),
    }
}

/// Relative paths are anchored at the crate directory, not the caller's cwd.
pub fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(cfg.access_ttl, Duration::minutes(15));
        assert_eq!(cfg.refresh_ttl, Duration::days(7));
        assert_eq!(cfg.verification_ttl, Duration::minutes(15));
        assert!(cfg.auth_db_path.ends_with(DEFAULT_DB_FILE));
        assert_eq!(
            cfg.rate_limits.get(RateLimitCategory::Login),
            QuotaPolicy::default_for(RateLimitCategory::Login)
        );
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let cfg = config(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("ACCESS_TOKEN_TTL_SECS", "not-a-number"),
            ("RATE_LIMIT_LOGIN", "10,2,30"),
            ("RATE_LIMIT_SIGNUP", "garbage"),
            ("AUTH_DB_PATH", "/tmp/ff-auth.db"),
        ]);

        assert_eq!(cfg.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.access_ttl, Duration::minutes(15));
        assert_eq!(cfg.auth_db_path, "/tmp/ff-auth.db");

        let login = cfg.rate_limits.get(RateLimitCategory::Login);
        assert_eq!(login.capacity, 10);
        assert_eq!(login.refill_amount, 2);
        assert_eq!(login.refill_period, Duration::seconds(30));
        assert_eq!(
            cfg.rate_limits.get(RateLimitCategory::Signup),
            QuotaPolicy::default_for(RateLimitCategory::Signup)
        );
    }

    #[test]
    fn test_default_log_filter_covers_binary() {
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        let targets: Vec<&str> = DEFAULT_LOG_FILTER
            .split(',')
            .filter_map(|d| d.split('=').next())
            .collect();
        assert!(targets.contains(&"finance_freedom"));
        assert!(targets.contains(&"finance_freedom_backend"));
    }

    #[test]
    fn test_refresh_ttl_must_exceed_access_ttl() {
        let cfg = config(&[
            ("ACCESS_TOKEN_TTL_SECS", "3600"),
            ("REFRESH_TOKEN_TTL_SECS", "60"),
        ]);
        assert_eq!(cfg.refresh_ttl, Duration::days(7));
    }
}
