//! Storage contracts consumed by the auth core
//!
//! The ledgers and the token machine only talk to these traits. All calls are
//! synchronous round-trips and may block the calling worker.

use crate::auth::models::{
    Identity, NewIdentity, RefreshRecord, TokenPurpose, VerificationToken,
};
use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait UserStore: Send + Sync {
    fn find_by_email(&self, email: &str) -> Result<Option<Identity>>;

    fn find_by_id(&self, id: i64) -> Result<Option<Identity>>;

    /// Insert a new identity (unverified, active). `None` when the email is already registered.
    fn create(&self, identity: &NewIdentity) -> Result<Option<Identity>>;

    /// Persist mutable fields of an existing identity
    fn save(&self, identity: &Identity) -> Result<()>;

    /// Returns false when nothing was deleted
    fn delete(&self, id: i64) -> Result<bool>;
}

pub trait RefreshStore: Send + Sync {
    fn insert(
        &self,
        user_id: i64,
        token: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<RefreshRecord>;

    fn find_by_token(&self, token: &str) -> Result<Option<RefreshRecord>>;

    fn count_for_owner(&self, user_id: i64) -> Result<usize>;

    /// Returns false when the row was already gone
    fn delete_by_token(&self, token: &str) -> Result<bool>;

    fn delete_all_for_owner(&self, user_id: i64) -> Result<usize>;

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Identity mutation applied together with consuming a verification token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEffect {
    MarkVerified { user_id: i64 },
    DeleteIdentity { user_id: i64 },
    /// Replace the hash and drop every refresh record of the identity
    ReplacePassword { user_id: i64, password_hash: String },
}

impl AccountEffect {
    pub fn user_id(&self) -> i64 {
        match self {
            AccountEffect::MarkVerified { user_id }
            | AccountEffect::DeleteIdentity { user_id }
            | AccountEffect::ReplacePassword { user_id, .. } => *user_id,
        }
    }
}

pub trait VerificationStore: Send + Sync {
    fn insert(
        &self,
        user_id: i64,
        token: &str,
        purpose: TokenPurpose,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<VerificationToken>;

    fn find_by_token(&self, token: &str) -> Result<Option<VerificationToken>>;

    fn count_for_owner(&self, user_id: i64) -> Result<usize>;

    fn delete_all_for_owner(&self, user_id: i64) -> Result<usize>;

    /// Delete the token row and apply `effect` as one unit.
    ///
    /// Returns `Ok(false)` without applying anything when the row is already
    /// gone, so of two concurrent redemptions at most one commits.
    fn commit_redemption(&self, token: &str, effect: &AccountEffect) -> Result<bool>;

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}
