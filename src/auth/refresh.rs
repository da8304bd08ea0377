//! Refresh Token Ledger
//! Mission: Persist, redeem and revoke long-lived refresh credentials
//!
//! A refresh token is itself a signed credential with a long TTL, recorded in the
//! refresh store so it can be revoked. Redemption does not rotate the record; the
//! same token stays usable until its own expiry or an explicit revoke.

use crate::auth::error::AuthError;
use crate::auth::jwt::CredentialSigner;
use crate::auth::models::{AccessCredential, CredentialKind, Identity, RefreshRecord};
use crate::auth::store::RefreshStore;
use crate::clock::Clock;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RefreshLedger {
    store: Arc<dyn RefreshStore>,
    signer: Arc<CredentialSigner>,
    clock: Arc<dyn Clock>,
    refresh_ttl: Duration,
    access_ttl: Duration,
}

impl RefreshLedger {
    pub fn new(
        store: Arc<dyn RefreshStore>,
        signer: Arc<CredentialSigner>,
        clock: Arc<dyn Clock>,
        refresh_ttl: Duration,
        access_ttl: Duration,
    ) -> Self {
        Self {
            store,
            signer,
            clock,
            refresh_ttl,
            access_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Issue and persist a refresh credential for `identity`
    pub fn issue(&self, identity: &Identity) -> Result<RefreshRecord, AuthError> {
        let credential = self
            .signer
            .issue(identity, CredentialKind::Refresh, self.refresh_ttl)?;
        let record = self.store.insert(
            identity.id,
            &credential.token,
            credential.issued_at,
            credential.expires_at,
        )?;

        info!(
            user_id = identity.id,
            expires_at = %record.expires_at,
            "Refresh token issued"
        );
        Ok(record)
    }

    /// Exchange a refresh token owned by `caller` for a fresh access credential
    pub fn redeem(&self, token: &str, caller: &Identity) -> Result<AccessCredential, AuthError> {
        let record = self.store.find_by_token(token)?.ok_or(AuthError::NotFound)?;

        if record.user_id != caller.id {
            warn!(
                caller_id = caller.id,
                owner_id = record.user_id,
                "Refresh token presented by non-owner"
            );
            return Err(AuthError::OwnershipMismatch);
        }

        if self.clock.now() >= record.expires_at {
            debug!(user_id = caller.id, "Refresh token past its expiry");
            return Err(AuthError::Expired);
        }

        let claims = self.signer.verify(&record.token, CredentialKind::Refresh)?;
        if claims.subject_id() != Some(caller.id) {
            warn!(caller_id = caller.id, sub = %claims.sub, "Refresh token subject mismatch");
            return Err(AuthError::OwnershipMismatch);
        }

        let access = self
            .signer
            .issue(caller, CredentialKind::Access, self.access_ttl)?;
        debug!(user_id = caller.id, "Access token refreshed");
        Ok(access)
    }

    /// Ownership-checked delete (logout)
    pub fn revoke(&self, token: &str, caller: &Identity) -> Result<(), AuthError> {
        let record = self.store.find_by_token(token)?.ok_or(AuthError::NotFound)?;

        if record.user_id != caller.id {
            warn!(
                caller_id = caller.id,
                owner_id = record.user_id,
                "Logout attempted with another identity's refresh token"
            );
            return Err(AuthError::OwnershipMismatch);
        }

        if !self.store.delete_by_token(token)? {
            return Err(AuthError::NotFound);
        }

        info!(user_id = caller.id, "Refresh token revoked");
        Ok(())
    }

    pub fn purge_expired(&self) -> Result<usize, AuthError> {
        Ok(self.store.purge_expired(self.clock.now())?)
    }
}
