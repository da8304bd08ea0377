//! Verification Token Machine
//! Mission: Issue and redeem single-use, purpose-scoped account tokens
//!
//! A token is `ISSUED` until it is redeemed (row deleted together with its
//! effect) or goes stale. Rejected redemptions never touch the row, so an
//! expired token keeps reporting `Expired` until the purge removes it.

use crate::auth::error::AuthError;
use crate::auth::models::{Identity, TokenPurpose, VerificationToken};
use crate::auth::object_store::ObjectStore;
use crate::auth::password::{PasswordHasher, MIN_PASSWORD_LEN};
use crate::auth::store::{AccountEffect, UserStore, VerificationStore};
use crate::clock::Clock;
use chrono::Duration;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Successful redemption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub user_id: i64,
    pub purpose: TokenPurpose,
    /// Post-commit side effect that failed; the account change itself stands
    pub side_effect_error: Option<String>,
}

impl Redemption {
    pub fn message(&self) -> &'static str {
        self.purpose.success_message()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendOutcome {
    Sent(VerificationToken),
    AlreadyVerified,
}

pub struct VerificationMachine {
    tokens: Arc<dyn VerificationStore>,
    users: Arc<dyn UserStore>,
    objects: Arc<dyn ObjectStore>,
    hasher: PasswordHasher,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl VerificationMachine {
    pub fn new(
        tokens: Arc<dyn VerificationStore>,
        users: Arc<dyn UserStore>,
        objects: Arc<dyn ObjectStore>,
        hasher: PasswordHasher,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            tokens,
            users,
            objects,
            hasher,
            clock,
            ttl,
        }
    }

    /// Mint and persist a token. Nothing about the identity changes yet.
    pub fn issue(
        &self,
        identity: &Identity,
        purpose: TokenPurpose,
    ) -> Result<VerificationToken, AuthError> {
        let now = self.clock.now();
        let token = Uuid::new_v4().to_string();
        let record = self
            .tokens
            .insert(identity.id, &token, purpose, now, now + self.ttl)?;

        info!(user_id = identity.id, %purpose, "Verification token issued");
        Ok(record)
    }

    /// Redeem `token` for `purpose`, applying the purpose's effect exactly once
    pub fn redeem(
        &self,
        token: &str,
        purpose: TokenPurpose,
        new_password: Option<&str>,
        old_password: Option<&str>,
    ) -> Result<Redemption, AuthError> {
        let record = self.tokens.find_by_token(token)?.ok_or_else(|| {
            warn!("Unknown verification token");
            AuthError::NotFound
        })?;

        if self.clock.now() >= record.expires_at {
            warn!(user_id = record.user_id, "Verification token expired");
            return Err(AuthError::Expired);
        }

        if record.purpose != purpose {
            warn!(
                user_id = record.user_id,
                expected = %purpose,
                actual = %record.purpose,
                "Token purpose mismatch"
            );
            return Err(AuthError::PurposeMismatch);
        }

        let owner = self
            .users
            .find_by_id(record.user_id)?
            .ok_or(AuthError::NotFound)?;

        let effect = match purpose {
            TokenPurpose::EmailVerification => {
                // Idempotent, so it is safe ahead of the commit and on retry
                self.objects.create_namespace(owner.id)?;
                AccountEffect::MarkVerified { user_id: owner.id }
            }
            TokenPurpose::AccountDeletion => AccountEffect::DeleteIdentity { user_id: owner.id },
            TokenPurpose::PasswordChange => {
                let old = old_password.ok_or(AuthError::MissingField("oldPassword"))?;
                let new = new_password.ok_or(AuthError::MissingField("newPassword"))?;
                ensure_strength(new)?;

                if !self.hasher.verify(old, &owner.password_hash)? {
                    warn!(user_id = owner.id, "Old password did not match");
                    return Err(AuthError::AuthFailure);
                }
                AccountEffect::ReplacePassword {
                    user_id: owner.id,
                    password_hash: self.hasher.hash(new)?,
                }
            }
            TokenPurpose::PasswordReset => {
                let new = new_password.ok_or(AuthError::MissingField("newPassword"))?;
                ensure_strength(new)?;
                AccountEffect::ReplacePassword {
                    user_id: owner.id,
                    password_hash: self.hasher.hash(new)?,
                }
            }
        };

        if !self.tokens.commit_redemption(token, &effect)? {
            warn!(user_id = owner.id, %purpose, "Token consumed by a concurrent redemption");
            return Err(AuthError::NotFound);
        }

        let side_effect_error = match purpose {
            TokenPurpose::AccountDeletion => {
                self.objects.delete_namespace(owner.id).err().map(|e| {
                    error!(user_id = owner.id, error = %format!("{e:#}"), "Failed to delete storage namespace");
                    format!("{e:#}")
                })
            }
            _ => None,
        };

        info!(user_id = owner.id, %purpose, "Verification token redeemed");
        Ok(Redemption {
            user_id: owner.id,
            purpose,
            side_effect_error,
        })
    }

    /// Replace every outstanding token of an unverified identity with a fresh
    /// `EMAIL_VERIFICATION` token
    pub fn resend(&self, email: &str) -> Result<ResendOutcome, AuthError> {
        let identity = self
            .users
            .find_by_email(email)?
            .ok_or(AuthError::NotFound)?;

        if identity.verified {
            info!(user_id = identity.id, "Resend skipped, already verified");
            return Ok(ResendOutcome::AlreadyVerified);
        }

        let dropped = self.tokens.delete_all_for_owner(identity.id)?;
        let token = self.issue(&identity, TokenPurpose::EmailVerification)?;
        info!(user_id = identity.id, dropped, "Verification token resent");
        Ok(ResendOutcome::Sent(token))
    }

    pub fn pending_for(&self, user_id: i64) -> Result<usize, AuthError> {
        Ok(self.tokens.count_for_owner(user_id)?)
    }

    pub fn purge_expired(&self) -> Result<usize, AuthError> {
        Ok(self.tokens.purge_expired(self.clock.now())?)
    }
}

pub(crate) fn ensure_strength(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword(MIN_PASSWORD_LEN));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::NewIdentity;
    use crate::auth::sqlite_store::SqliteAuthStore;
    use crate::auth::store::RefreshStore;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct CountingObjects {
        created: AtomicUsize,
        deleted: AtomicUsize,
        fail_delete: AtomicBool,
    }

    impl ObjectStore for CountingObjects {
        fn create_namespace(&self, _user_id: i64) -> anyhow::Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn delete_namespace(&self, _user_id: i64) -> anyhow::Result<()> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete.load(Ordering::SeqCst) {
                anyhow::bail!("bucket unavailable");
            }
            Ok(())
        }
    }

    struct Fixture {
        machine: VerificationMachine,
        store: Arc<SqliteAuthStore>,
        objects: Arc<CountingObjects>,
        clock: Arc<ManualClock>,
        hasher: PasswordHasher,
        _temp: NamedTempFile,
    }

    fn setup() -> Fixture {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteAuthStore::new(temp.path().to_str().unwrap()).unwrap());
        let objects = Arc::new(CountingObjects::default());
        let clock = Arc::new(ManualClock::from_unix_secs(1_700_000_000));
        let hasher = PasswordHasher::with_cost(4);
        let machine = VerificationMachine::new(
            store.clone(),
            store.clone(),
            objects.clone(),
            hasher,
            clock.clone(),
            Duration::minutes(15),
        );
        Fixture {
            machine,
            store,
            objects,
            clock,
            hasher,
            _temp: temp,
        }
    }

    fn create_user(fx: &Fixture, email: &str, password: &str) -> Identity {
        fx.store
            .create(&NewIdentity {
                email: email.to_string(),
                full_name: "Token Tester".to_string(),
                password_hash: fx.hasher.hash(password).unwrap(),
                created_at: fx.clock.now(),
            })
            .unwrap()
            .unwrap()
    }

    fn add_refresh(fx: &Fixture, user: &Identity, token: &str) {
        let now = fx.clock.now();
        RefreshStore::insert(fx.store.as_ref(), user.id, token, now, now + Duration::days(7))
            .unwrap();
    }

    #[test]
    fn test_issue_uses_uniform_ttl() {
        let fx = setup();
        let user = create_user(&fx, "ttl@example.com", "password123");

        for purpose in TokenPurpose::ALL {
            let token = fx.machine.issue(&user, purpose).unwrap();
            assert_eq!(token.expires_at - token.created_at, Duration::minutes(15));
            assert_eq!(token.purpose, purpose);
        }
        assert_eq!(fx.machine.pending_for(user.id).unwrap(), 4);
    }

    #[test]
    fn test_email_verification_redeems_once() {
        let fx = setup();
        let user = create_user(&fx, "verify@example.com", "password123");
        let token = fx
            .machine
            .issue(&user, TokenPurpose::EmailVerification)
            .unwrap();

        let redemption = fx
            .machine
            .redeem(&token.token, TokenPurpose::EmailVerification, None, None)
            .unwrap();
        assert_eq!(redemption.message(), "Email verified successfully");
        assert!(fx.store.find_by_id(user.id).unwrap().unwrap().verified);
        assert_eq!(fx.objects.created.load(Ordering::SeqCst), 1);

        assert!(matches!(
            fx.machine
                .redeem(&token.token, TokenPurpose::EmailVerification, None, None),
            Err(AuthError::NotFound)
        ));
        assert_eq!(fx.objects.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purpose_mismatch_changes_nothing() {
        let fx = setup();
        let user = create_user(&fx, "mismatch@example.com", "password123");
        let token = fx
            .machine
            .issue(&user, TokenPurpose::EmailVerification)
            .unwrap();

        for wrong in [
            TokenPurpose::AccountDeletion,
            TokenPurpose::PasswordChange,
            TokenPurpose::PasswordReset,
        ] {
            assert!(matches!(
                fx.machine
                    .redeem(&token.token, wrong, Some("newpassword1"), Some("password123")),
                Err(AuthError::PurposeMismatch)
            ));
        }

        let reloaded = fx.store.find_by_id(user.id).unwrap().unwrap();
        assert_eq!(reloaded, user);
        assert!(VerificationStore::find_by_token(fx.store.as_ref(), &token.token)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_expired_token_stays_expired() {
        let fx = setup();
        let user = create_user(&fx, "late@example.com", "password123");
        let token = fx
            .machine
            .issue(&user, TokenPurpose::EmailVerification)
            .unwrap();

        fx.clock.advance(Duration::minutes(15));
        for _ in 0..2 {
            assert!(matches!(
                fx.machine
                    .redeem(&token.token, TokenPurpose::EmailVerification, None, None),
                Err(AuthError::Expired)
            ));
        }
        assert!(!fx.store.find_by_id(user.id).unwrap().unwrap().verified);

        assert_eq!(fx.machine.purge_expired().unwrap(), 1);
        assert!(matches!(
            fx.machine
                .redeem(&token.token, TokenPurpose::EmailVerification, None, None),
            Err(AuthError::NotFound)
        ));
    }

    #[test]
    fn test_password_change_wrong_old_password() {
        let fx = setup();
        let user = create_user(&fx, "change@example.com", "password123");
        add_refresh(&fx, &user, "session-1");
        let token = fx.machine.issue(&user, TokenPurpose::PasswordChange).unwrap();

        assert!(matches!(
            fx.machine.redeem(
                &token.token,
                TokenPurpose::PasswordChange,
                Some("newpassword1"),
                Some("not-my-password")
            ),
            Err(AuthError::AuthFailure)
        ));

        let reloaded = fx.store.find_by_id(user.id).unwrap().unwrap();
        assert_eq!(reloaded.password_hash, user.password_hash);
        assert_eq!(RefreshStore::count_for_owner(fx.store.as_ref(), user.id).unwrap(), 1);
        assert_eq!(fx.machine.pending_for(user.id).unwrap(), 1);
    }

    #[test]
    fn test_password_change_requires_both_passwords() {
        let fx = setup();
        let user = create_user(&fx, "fields@example.com", "password123");
        let token = fx.machine.issue(&user, TokenPurpose::PasswordChange).unwrap();

        assert!(matches!(
            fx.machine
                .redeem(&token.token, TokenPurpose::PasswordChange, Some("newpassword1"), None),
            Err(AuthError::MissingField("oldPassword"))
        ));
        assert!(matches!(
            fx.machine
                .redeem(&token.token, TokenPurpose::PasswordChange, None, Some("password123")),
            Err(AuthError::MissingField("newPassword"))
        ));
        assert_eq!(fx.machine.pending_for(user.id).unwrap(), 1);
    }

    #[test]
    fn test_password_flows_revoke_all_sessions() {
        let fx = setup();
        let user = create_user(&fx, "sessions@example.com", "password123");

        add_refresh(&fx, &user, "session-1");
        add_refresh(&fx, &user, "session-2");
        let change = fx.machine.issue(&user, TokenPurpose::PasswordChange).unwrap();
        let redemption = fx
            .machine
            .redeem(
                &change.token,
                TokenPurpose::PasswordChange,
                Some("newpassword1"),
                Some("password123"),
            )
            .unwrap();
        assert_eq!(redemption.message(), "Password changed successfully");
        assert_eq!(RefreshStore::count_for_owner(fx.store.as_ref(), user.id).unwrap(), 0);

        let hash = fx.store.find_by_id(user.id).unwrap().unwrap().password_hash;
        assert!(fx.hasher.verify("newpassword1", &hash).unwrap());

        add_refresh(&fx, &user, "session-3");
        let reset = fx.machine.issue(&user, TokenPurpose::PasswordReset).unwrap();
        fx.machine
            .redeem(&reset.token, TokenPurpose::PasswordReset, Some("resetpass99"), None)
            .unwrap();
        assert_eq!(RefreshStore::count_for_owner(fx.store.as_ref(), user.id).unwrap(), 0);

        let hash = fx.store.find_by_id(user.id).unwrap().unwrap().password_hash;
        assert!(fx.hasher.verify("resetpass99", &hash).unwrap());
    }

    #[test]
    fn test_weak_new_password_rejected() {
        let fx = setup();
        let user = create_user(&fx, "weak@example.com", "password123");
        let token = fx.machine.issue(&user, TokenPurpose::PasswordReset).unwrap();

        assert!(matches!(
            fx.machine
                .redeem(&token.token, TokenPurpose::PasswordReset, Some("short"), None),
            Err(AuthError::WeakPassword(MIN_PASSWORD_LEN))
        ));
        assert_eq!(fx.machine.pending_for(user.id).unwrap(), 1);
    }

    #[test]
    fn test_account_deletion_surfaces_namespace_failure() {
        let fx = setup();
        let user = create_user(&fx, "bye@example.com", "password123");
        add_refresh(&fx, &user, "session-1");
        let token = fx.machine.issue(&user, TokenPurpose::AccountDeletion).unwrap();
        fx.objects.fail_delete.store(true, Ordering::SeqCst);

        let redemption = fx
            .machine
            .redeem(&token.token, TokenPurpose::AccountDeletion, None, None)
            .unwrap();

        assert_eq!(redemption.message(), "Account deleted successfully");
        assert!(redemption
            .side_effect_error
            .as_deref()
            .is_some_and(|e| e.contains("bucket unavailable")));
        assert!(fx.store.find_by_id(user.id).unwrap().is_none());
        assert_eq!(fx.objects.deleted.load(Ordering::SeqCst), 1);
        assert!(RefreshStore::find_by_token(fx.store.as_ref(), "session-1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_resend_replaces_outstanding_tokens() {
        let fx = setup();
        let user = create_user(&fx, "resend@example.com", "password123");
        let first = fx
            .machine
            .issue(&user, TokenPurpose::EmailVerification)
            .unwrap();
        fx.machine.issue(&user, TokenPurpose::PasswordReset).unwrap();

        let outcome = fx.machine.resend("resend@example.com").unwrap();
        let ResendOutcome::Sent(second) = outcome else {
            panic!("expected a new token");
        };
        assert_ne!(first.token, second.token);
        assert_eq!(fx.machine.pending_for(user.id).unwrap(), 1);
        assert!(matches!(
            fx.machine
                .redeem(&first.token, TokenPurpose::EmailVerification, None, None),
            Err(AuthError::NotFound)
        ));

        fx.machine
            .redeem(&second.token, TokenPurpose::EmailVerification, None, None)
            .unwrap();
        assert_eq!(
            fx.machine.resend("resend@example.com").unwrap(),
            ResendOutcome::AlreadyVerified
        );
        assert!(matches!(
            fx.machine.resend("ghost@example.com"),
            Err(AuthError::NotFound)
        ));
    }

    #[test]
    fn test_concurrent_redemption_commits_once() {
        let fx = setup();
        let user = create_user(&fx, "race@example.com", "password123");
        let token = fx
            .machine
            .issue(&user, TokenPurpose::EmailVerification)
            .unwrap();

        let workers = 8;
        let barrier = Barrier::new(workers);
        let successes = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    barrier.wait();
                    match fx.machine.redeem(
                        &token.token,
                        TokenPurpose::EmailVerification,
                        None,
                        None,
                    ) {
                        Ok(_) => {
                            successes.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(AuthError::NotFound) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                });
            }
        });

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert!(fx.store.find_by_id(user.id).unwrap().unwrap().verified);
    }
}
