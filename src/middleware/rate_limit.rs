//! Rate limiting middleware.
//!
//! One token bucket per (identity or client IP, action category). Buckets are
//! created lazily and refill in whole intervals: after each full refill period
//! the bucket gains the policy's refill amount, capped at capacity.
//!
//! The bucket map lock is held only to find or insert a bucket; consuming
//! locks that single bucket.

use crate::auth::error::AuthError;
use crate::auth::middleware::CurrentUser;
use crate::clock::Clock;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Action classes with independent quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitCategory {
    Login,
    Signup,
    Transaction,
    Budget,
    LinkedAccount,
    SavingGoal,
    RefreshToken,
    DeleteUser,
    PasswordChange,
    PasswordReset,
    VerifyToken,
    Default,
}

impl RateLimitCategory {
    pub const ALL: [RateLimitCategory; 12] = [
        RateLimitCategory::Login,
        RateLimitCategory::Signup,
        RateLimitCategory::Transaction,
        RateLimitCategory::Budget,
        RateLimitCategory::LinkedAccount,
        RateLimitCategory::SavingGoal,
        RateLimitCategory::RefreshToken,
        RateLimitCategory::DeleteUser,
        RateLimitCategory::PasswordChange,
        RateLimitCategory::PasswordReset,
        RateLimitCategory::VerifyToken,
        RateLimitCategory::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitCategory::Login => "LOGIN",
            RateLimitCategory::Signup => "SIGNUP",
            RateLimitCategory::Transaction => "TRANSACTION",
            RateLimitCategory::Budget => "BUDGET",
            RateLimitCategory::LinkedAccount => "LINKED_ACCOUNT",
            RateLimitCategory::SavingGoal => "SAVING_GOAL",
            RateLimitCategory::RefreshToken => "REFRESH_TOKEN",
            RateLimitCategory::DeleteUser => "DELETE_USER",
            RateLimitCategory::PasswordChange => "PASSWORD_CHANGE",
            RateLimitCategory::PasswordReset => "PASSWORD_RESET",
            RateLimitCategory::VerifyToken => "VERIFY_TOKEN",
            RateLimitCategory::Default => "DEFAULT",
        }
    }

    /// Human action label used in rejection messages
    pub fn action(&self) -> &'static str {
        match self {
            RateLimitCategory::Login => "login",
            RateLimitCategory::Signup => "signup",
            RateLimitCategory::Transaction => "transaction",
            RateLimitCategory::Budget => "budget",
            RateLimitCategory::LinkedAccount => "linked account",
            RateLimitCategory::SavingGoal => "saving goal",
            RateLimitCategory::RefreshToken => "token refresh",
            RateLimitCategory::DeleteUser => "account deletion",
            RateLimitCategory::PasswordChange => "password change",
            RateLimitCategory::PasswordReset => "password reset",
            RateLimitCategory::VerifyToken => "verification",
            RateLimitCategory::Default => "request",
        }
    }

    /// Environment variable holding an override for this category
    pub fn env_var(&self) -> String {
        format!("RATE_LIMIT_{}", self.as_str())
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity plus interval refill for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub capacity: u32,
    pub refill_amount: u32,
    pub refill_period: Duration,
}

impl QuotaPolicy {
    /// `None` unless counts are positive and the period is at least a millisecond
    pub fn new(capacity: u32, refill_amount: u32, refill_period: Duration) -> Option<Self> {
        if capacity == 0 || refill_amount == 0 || refill_period < Duration::milliseconds(1) {
            return None;
        }
        Some(Self {
            capacity,
            refill_amount,
            refill_period,
        })
    }

    fn fixed(capacity: u32, refill_amount: u32, period_secs: i64) -> Self {
        Self {
            capacity,
            refill_amount,
            refill_period: Duration::seconds(period_secs),
        }
    }

    /// Parse `capacity,refill_amount,refill_period_secs`
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(',').map(str::trim);
        let capacity = parts.next()?.parse().ok()?;
        let refill_amount = parts.next()?.parse().ok()?;
        let period_secs: i64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Self::new(capacity, refill_amount, Duration::seconds(period_secs))
    }

    pub fn default_for(category: RateLimitCategory) -> Self {
        use RateLimitCategory::*;
        match category {
            Login | Signup => Self::fixed(5, 1, 60),
            Transaction => Self::fixed(100, 100, 60),
            Budget | SavingGoal => Self::fixed(20, 5, 300),
            RefreshToken => Self::fixed(2, 1, 600),
            LinkedAccount => Self::fixed(20, 20, 600),
            DeleteUser | PasswordChange => Self::fixed(1, 1, 3600),
            VerifyToken => Self::fixed(5, 1, 600),
            PasswordReset => Self::fixed(3, 1, 86_400),
            Default => Self::fixed(20, 20, 60),
        }
    }
}

/// Per-category policy table; unset categories use the built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct RateLimitPolicies {
    overrides: HashMap<RateLimitCategory, QuotaPolicy>,
}

impl RateLimitPolicies {
    pub fn with_override(mut self, category: RateLimitCategory, policy: QuotaPolicy) -> Self {
        self.overrides.insert(category, policy);
        self
    }

    pub fn get(&self, category: RateLimitCategory) -> QuotaPolicy {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| QuotaPolicy::default_for(category))
    }
}

/// Who a bucket belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QuotaKey {
    User(i64),
    Client(String),
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKey::User(id) => write!(f, "{id}"),
            QuotaKey::Client(ip) => f.write_str(ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketId {
    key: QuotaKey,
    category: RateLimitCategory,
}

#[derive(Debug)]
struct QuotaBucket {
    tokens: u32,
    last_refill: DateTime<Utc>,
}

impl QuotaBucket {
    fn full(policy: &QuotaPolicy, now: DateTime<Utc>) -> Self {
        Self {
            tokens: policy.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, policy: &QuotaPolicy, now: DateTime<Utc>) {
        let elapsed = now - self.last_refill;
        if elapsed < policy.refill_period {
            return;
        }

        // Fields are public; never divide by a sub-millisecond period
        let period_ms = policy.refill_period.num_milliseconds().max(1);
        let periods = elapsed.num_milliseconds() / period_ms;
        let added = periods.saturating_mul(policy.refill_amount as i64);
        let tokens = (self.tokens as i64).saturating_add(added);
        self.tokens = tokens.min(policy.capacity as i64) as u32;
        self.last_refill += Duration::milliseconds(period_ms * periods);
    }

    fn try_consume(&mut self, policy: &QuotaPolicy, now: DateTime<Utc>) -> Admission {
        self.refill(policy, now);
        if self.tokens > 0 {
            self.tokens -= 1;
            Admission::Allowed {
                remaining: self.tokens,
            }
        } else {
            let wait = (self.last_refill + policy.refill_period - now).max(Duration::zero());
            Admission::Rejected {
                retry_after: wait.to_std().unwrap_or_default(),
            }
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Rejected { retry_after: std::time::Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Process-wide bucket registry, constructed once and shared.
pub struct RateLimiter {
    policies: RateLimitPolicies,
    clock: Arc<dyn Clock>,
    buckets: RwLock<HashMap<BucketId, Arc<Mutex<QuotaBucket>>>>,
}

impl RateLimiter {
    pub fn new(policies: RateLimitPolicies, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies,
            clock,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn bucket(&self, id: &BucketId) -> Arc<Mutex<QuotaBucket>> {
        if let Some(bucket) = self.buckets.read().get(id) {
            return bucket.clone();
        }

        let policy = self.policies.get(id.category);
        let now = self.clock.now();
        self.buckets
            .write()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(QuotaBucket::full(&policy, now))))
            .clone()
    }

    /// Take one token from the `(key, category)` bucket
    pub fn admit(&self, key: &QuotaKey, category: RateLimitCategory) -> Admission {
        let id = BucketId {
            key: key.clone(),
            category,
        };
        let policy = self.policies.get(category);
        let bucket = self.bucket(&id);
        let admission = bucket.lock().try_consume(&policy, self.clock.now());
        admission
    }

    /// Drop buckets that have refilled to capacity and are not in use.
    ///
    /// Recreation starts full, so this is invisible to callers.
    pub fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();

        buckets.retain(|id, bucket| {
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            let policy = self.policies.get(id.category);
            let mut state = bucket.lock();
            state.refill(&policy, now);
            state.tokens < policy.capacity
        });

        let pruned = before - buckets.len();
        if pruned > 0 {
            debug!(pruned, remaining = buckets.len(), "Pruned idle rate limit buckets");
        }
        pruned
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }
}

/// First `X-Forwarded-For` entry, else the socket address.
pub fn resolve_client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match (forwarded, remote) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// State for one route's quota layer.
#[derive(Clone)]
pub struct QuotaGuard {
    limiter: Arc<RateLimiter>,
    category: RateLimitCategory,
}

impl QuotaGuard {
    pub fn new(limiter: Arc<RateLimiter>, category: RateLimitCategory) -> Self {
        Self { limiter, category }
    }
}

/// Rate limiting middleware function.
///
/// Keys on the authenticated identity when the gate attached one, otherwise on
/// the client IP.
pub async fn enforce_quota(
    State(guard): State<QuotaGuard>,
    request: Request,
    next: Next,
) -> Response {
    let key = match request.extensions().get::<CurrentUser>() {
        Some(CurrentUser(identity)) => QuotaKey::User(identity.id),
        None => {
            let remote = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            QuotaKey::Client(resolve_client_ip(request.headers(), remote))
        }
    };

    match guard.limiter.admit(&key, guard.category) {
        Admission::Allowed { .. } => next.run(request).await,
        Admission::Rejected { retry_after } => {
            warn!(
                key = %key,
                category = %guard.category,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );

            let mut response = AuthError::QuotaExceeded {
                action: guard.category.action().to_string(),
            }
            .into_response();
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
            response
        }
    }
}
