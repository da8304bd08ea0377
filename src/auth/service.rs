//! Account Service
//! Mission: Caller-facing account operations composed from the auth core
//!
//! Every operation takes the caller's identity explicitly when it needs one;
//! nothing here reads request state.

use crate::auth::error::AuthError;
use crate::auth::jwt::CredentialSigner;
use crate::auth::mailer::{EmailTemplates, Mailer};
use crate::auth::models::{
    AccessCredential, CredentialKind, Identity, NewIdentity, RefreshRecord, RegisterRequest,
    TokenPurpose, UserDetails, VerificationToken, VerifyForm,
};
use crate::auth::password::PasswordHasher;
use crate::auth::refresh::RefreshLedger;
use crate::auth::store::UserStore;
use crate::auth::verification::{ensure_strength, Redemption, ResendOutcome, VerificationMachine};
use crate::clock::Clock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outbound mail plus the templates that fill it
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    templates: EmailTemplates,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, templates: EmailTemplates) -> Self {
        Self { mailer, templates }
    }

    fn send_token(&self, to: &str, token: &VerificationToken) -> Result<(), AuthError> {
        let (subject, body) = self.templates.render(token.purpose, &token.token);
        self.mailer.send(to, &subject, &body)?;
        debug!(user_id = token.user_id, purpose = %token.purpose, "Token email sent");
        Ok(())
    }
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub identity: Identity,
    pub access: AccessCredential,
    pub refresh: Option<RefreshRecord>,
}

pub struct AccountService {
    users: Arc<dyn UserStore>,
    signer: Arc<CredentialSigner>,
    refresh: Arc<RefreshLedger>,
    verification: Arc<VerificationMachine>,
    notifier: Notifier,
    hasher: PasswordHasher,
    clock: Arc<dyn Clock>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl AccountService {
    pub fn new(
        users: Arc<dyn UserStore>,
        signer: Arc<CredentialSigner>,
        refresh: Arc<RefreshLedger>,
        verification: Arc<VerificationMachine>,
        notifier: Notifier,
        hasher: PasswordHasher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            signer,
            refresh,
            verification,
            notifier,
            hasher,
            clock,
        }
    }

    pub fn signer(&self) -> Arc<CredentialSigner> {
        self.signer.clone()
    }

    pub fn users(&self) -> Arc<dyn UserStore> {
        self.users.clone()
    }

    /// Create an unverified account and mail its verification token
    pub fn register(&self, request: &RegisterRequest) -> Result<Identity, AuthError> {
        let email = normalize_email(&request.email);
        let full_name = request.full_name.trim();
        if email.is_empty() {
            return Err(AuthError::MissingField("email"));
        }
        if full_name.is_empty() {
            return Err(AuthError::MissingField("fullName"));
        }
        ensure_strength(&request.password)?;

        if self.users.find_by_email(&email)?.is_some() {
            warn!("Registration attempted with a taken email");
            return Err(AuthError::EmailTaken);
        }

        let created = self.users.create(&NewIdentity {
            email,
            full_name: full_name.to_string(),
            password_hash: self.hasher.hash(&request.password)?,
            created_at: self.clock.now(),
        })?;
        // A concurrent registration can win between the lookup and the insert
        let Some(identity) = created else {
            warn!("Registration lost a race for the same email");
            return Err(AuthError::EmailTaken);
        };

        let token = self
            .verification
            .issue(&identity, TokenPurpose::EmailVerification)?;
        self.notifier.send_token(&identity.email, &token)?;

        info!(user_id = identity.id, "User registered");
        Ok(identity)
    }

    /// Wrong email and wrong password both surface as `AuthFailure`
    pub fn login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<LoginOutcome, AuthError> {
        let email = normalize_email(email);
        let mut identity = match self.users.find_by_email(&email)? {
            Some(identity) => identity,
            None => {
                debug!("Login for unknown email");
                return Err(AuthError::AuthFailure);
            }
        };

        if !self.hasher.verify(password, &identity.password_hash)? || !identity.active {
            warn!(user_id = identity.id, "Login rejected");
            return Err(AuthError::AuthFailure);
        }
        if !identity.verified {
            info!(user_id = identity.id, "Login before email verification");
            return Err(AuthError::NotVerified);
        }

        identity.last_login_at = Some(self.clock.now());
        self.users.save(&identity)?;

        let access = self
            .signer
            .issue(&identity, CredentialKind::Access, self.refresh.access_ttl())?;
        let refresh = if remember_me {
            Some(self.refresh.issue(&identity)?)
        } else {
            None
        };

        info!(user_id = identity.id, remember_me, "User logged in");
        Ok(LoginOutcome {
            identity,
            access,
            refresh,
        })
    }

    pub fn refresh(&self, token: &str, caller: &Identity) -> Result<AccessCredential, AuthError> {
        self.refresh.redeem(token, caller)
    }

    pub fn logout(&self, token: &str, caller: &Identity) -> Result<(), AuthError> {
        self.refresh.revoke(token, caller)
    }

    /// Issue a purpose token for the caller and mail it to their address
    pub fn request_verification(
        &self,
        caller: &Identity,
        purpose: TokenPurpose,
    ) -> Result<VerificationToken, AuthError> {
        let token = self.verification.issue(caller, purpose)?;
        self.notifier.send_token(&caller.email, &token)?;
        Ok(token)
    }

    pub fn request_password_reset(&self, email: &str) -> Result<VerificationToken, AuthError> {
        let identity = self
            .users
            .find_by_email(&normalize_email(email))?
            .ok_or(AuthError::NotFound)?;
        self.request_verification(&identity, TokenPurpose::PasswordReset)
    }

    pub fn redeem_verification(&self, form: &VerifyForm) -> Result<Redemption, AuthError> {
        self.verification.redeem(
            form.token.trim(),
            form.purpose,
            form.new_password.as_deref(),
            form.old_password.as_deref(),
        )
    }

    pub fn resend_verification(&self, email: &str) -> Result<ResendOutcome, AuthError> {
        let email = normalize_email(email);
        let outcome = self.verification.resend(&email)?;
        if let ResendOutcome::Sent(ref token) = outcome {
            self.notifier.send_token(&email, token)?;
        }
        Ok(outcome)
    }

    pub fn user_details(&self, caller: &Identity) -> UserDetails {
        UserDetails::from_identity(caller)
    }

    /// Drop stale refresh and verification rows; returns `(refresh, verification)`
    pub fn purge_expired(&self) -> Result<(usize, usize), AuthError> {
        let refresh = self.refresh.purge_expired()?;
        let verification = self.verification.purge_expired()?;
        if refresh + verification > 0 {
            info!(refresh, verification, "Purged expired tokens");
        }
        Ok((refresh, verification))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::mailer::MemoryMailer;
    use crate::auth::object_store::LocalObjectStore;
    use crate::auth::secrets::StaticSecret;
    use crate::auth::sqlite_store::SqliteAuthStore;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use tempfile::{NamedTempFile, TempDir};

    pub(crate) struct Harness {
        pub service: Arc<AccountService>,
        pub mailer: Arc<MemoryMailer>,
        pub clock: Arc<ManualClock>,
        _db: NamedTempFile,
        _objects: TempDir,
    }

    pub(crate) fn harness() -> Harness {
        let db = NamedTempFile::new().unwrap();
        let objects_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteAuthStore::new(db.path().to_str().unwrap()).unwrap());
        let clock = Arc::new(ManualClock::from_unix_secs(1_700_000_000));
        let signer = Arc::new(CredentialSigner::new(
            Arc::new(StaticSecret::new("service-test-secret-0123456789abcdef")),
            clock.clone(),
        ));
        let hasher = PasswordHasher::with_cost(4);
        let refresh = Arc::new(RefreshLedger::new(
            store.clone(),
            signer.clone(),
            clock.clone(),
            Duration::days(7),
            Duration::minutes(15),
        ));
        let verification = Arc::new(VerificationMachine::new(
            store.clone(),
            store.clone(),
            Arc::new(LocalObjectStore::new(objects_dir.path())),
            hasher,
            clock.clone(),
            Duration::minutes(15),
        ));
        let mailer = Arc::new(MemoryMailer::new());
        let service = Arc::new(AccountService::new(
            store,
            signer,
            refresh,
            verification,
            Notifier::new(mailer.clone(), EmailTemplates::new("http://localhost:8080")),
            hasher,
            clock.clone(),
        ));
        Harness {
            service,
            mailer,
            clock,
            _db: db,
            _objects: objects_dir,
        }
    }

    pub(crate) fn token_from_mail(body: &str) -> String {
        let marker = "name='token' value='";
        let start = body.find(marker).unwrap() + marker.len();
        let end = body[start..].find('\'').unwrap();
        body[start..start + end].to_string()
    }

    fn register(h: &Harness, email: &str) -> Identity {
        h.service
            .register(&RegisterRequest {
                email: email.to_string(),
                full_name: "Service Tester".to_string(),
                password: "password123".to_string(),
            })
            .unwrap()
    }

    pub(crate) fn register_verified(h: &Harness, email: &str) -> Identity {
        register(h, email);
        let mail = h.mailer.last_to(email).unwrap();
        h.service
            .redeem_verification(&VerifyForm {
                token: token_from_mail(&mail.html_body),
                purpose: TokenPurpose::EmailVerification,
                new_password: None,
                old_password: None,
            })
            .unwrap();
        h.service.users().find_by_email(email).unwrap().unwrap()
    }

    #[test]
    fn test_register_mails_verification_token() {
        let h = harness();
        let identity = register(&h, "  New@Example.com ");

        assert_eq!(identity.email, "new@example.com");
        assert!(!identity.verified);

        let mail = h.mailer.last_to("new@example.com").unwrap();
        assert_eq!(mail.subject, "Account Verification - Finance Freedom");
        assert!(mail.html_body.contains("EMAIL_VERIFICATION"));
    }

    #[test]
    fn test_register_rejects_taken_email_and_weak_password() {
        let h = harness();
        register(&h, "taken@example.com");

        let dup = h.service.register(&RegisterRequest {
            email: "TAKEN@example.com".to_string(),
            full_name: "Dup".to_string(),
            password: "password123".to_string(),
        });
        assert!(matches!(dup, Err(AuthError::EmailTaken)));

        let weak = h.service.register(&RegisterRequest {
            email: "weak@example.com".to_string(),
            full_name: "Weak".to_string(),
            password: "short".to_string(),
        });
        assert!(matches!(weak, Err(AuthError::WeakPassword(_))));
    }

    #[test]
    fn test_concurrent_registration_of_one_email() {
        use std::sync::Barrier;

        let h = harness();
        let barrier = Barrier::new(8);
        let results: Vec<Result<Identity, AuthError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        h.service.register(&RegisterRequest {
                            email: "race@example.com".to_string(),
                            full_name: "Racer".to_string(),
                            password: "password123".to_string(),
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        let created = results.iter().filter(|r| r.is_ok()).count();
        let taken = results
            .iter()
            .filter(|r| matches!(r, Err(AuthError::EmailTaken)))
            .count();
        assert_eq!(created, 1);
        assert_eq!(taken, 7);
        assert_eq!(
            h.mailer
                .sent()
                .iter()
                .filter(|m| m.to == "race@example.com")
                .count(),
            1
        );
    }

    #[test]
    fn test_login_requires_verification() {
        let h = harness();
        register(&h, "pending@example.com");

        assert!(matches!(
            h.service.login("pending@example.com", "password123", false),
            Err(AuthError::NotVerified)
        ));
    }

    #[test]
    fn test_login_failures_are_indistinguishable() {
        let h = harness();
        register_verified(&h, "user@example.com");

        let wrong_password = h.service.login("user@example.com", "nope-nope", false);
        let unknown = h.service.login("ghost@example.com", "password123", false);
        assert!(matches!(wrong_password, Err(AuthError::AuthFailure)));
        assert!(matches!(unknown, Err(AuthError::AuthFailure)));
    }

    #[test]
    fn test_login_records_last_login() {
        let h = harness();
        register_verified(&h, "user@example.com");

        let outcome = h
            .service
            .login("user@example.com", "password123", false)
            .unwrap();
        assert!(outcome.refresh.is_none());
        assert_eq!(outcome.identity.last_login_at, Some(h.clock.now()));

        let stored = h
            .service
            .users()
            .find_by_email("user@example.com")
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_login_at, Some(h.clock.now()));
    }

    #[test]
    fn test_password_reset_request() {
        let h = harness();
        register_verified(&h, "forgot@example.com");

        let token = h.service.request_password_reset("forgot@example.com").unwrap();
        assert_eq!(token.purpose, TokenPurpose::PasswordReset);

        let mail = h.mailer.last_to("forgot@example.com").unwrap();
        assert_eq!(mail.subject, "Password Reset - Finance Freedom");
        assert_eq!(token_from_mail(&mail.html_body), token.token);

        assert!(matches!(
            h.service.request_password_reset("ghost@example.com"),
            Err(AuthError::NotFound)
        ));
    }

    #[test]
    fn test_purge_expired() {
        let h = harness();
        let identity = register_verified(&h, "purge@example.com");
        h.service.login("purge@example.com", "password123", true).unwrap();
        h.service
            .request_verification(&identity, TokenPurpose::AccountDeletion)
            .unwrap();

        h.clock.advance(Duration::days(8));
        assert_eq!(h.service.purge_expired().unwrap(), (1, 1));
    }
}
