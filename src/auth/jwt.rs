//! Credential Signer
//! Mission: Issue and verify stateless signed credentials

use crate::auth::error::AuthError;
use crate::auth::models::{AccessCredential, Claims, CredentialKind, Identity};
use crate::auth::secrets::SecretProvider;
use crate::clock::Clock;
use anyhow::Context;
use chrono::{DateTime, Duration};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Signs and verifies HS256 credentials with the provider's current key
pub struct CredentialSigner {
    secrets: Arc<dyn SecretProvider>,
    clock: Arc<dyn Clock>,
}

impl CredentialSigner {
    pub fn new(secrets: Arc<dyn SecretProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { secrets, clock }
    }

    /// Issue a `kind` credential for `identity` valid for `ttl` from now
    pub fn issue(
        &self,
        identity: &Identity,
        kind: CredentialKind,
        ttl: Duration,
    ) -> Result<AccessCredential, AuthError> {
        let iat = self.clock.now().timestamp();
        let exp = iat + ttl.num_seconds();

        let claims = Claims {
            sub: identity.id.to_string(),
            email: identity.email.clone(),
            username: identity.full_name.clone(),
            iat,
            exp,
            jti: Uuid::new_v4().simple().to_string(),
            typ: kind,
        };

        let key = self.secrets.signing_key()?;
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&key),
        )
        .context("Failed to sign credential")?;

        debug!(
            user_id = identity.id,
            kind = ?kind,
            ttl_secs = ttl.num_seconds(),
            "Issued credential"
        );

        Ok(AccessCredential {
            token,
            issued_at: timestamp(iat)?,
            expires_at: timestamp(exp)?,
        })
    }

    /// Check signature, kind and expiry, returning the embedded claims.
    ///
    /// Bad structure, bad signature or a credential of another kind is `Malformed`;
    /// a valid but stale credential is `Expired`.
    pub fn verify(&self, token: &str, expected: CredentialKind) -> Result<Claims, AuthError> {
        let key = self.secrets.signing_key()?;

        // Expiry is checked below against the injected clock
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let decoded = decode::<Claims>(token, &DecodingKey::from_secret(&key), &validation)
            .map_err(|e| {
                debug!(error = %e, "Credential rejected");
                AuthError::Malformed
            })?;

        if decoded.claims.typ != expected {
            warn!(
                sub = %decoded.claims.sub,
                presented = ?decoded.claims.typ,
                expected = ?expected,
                "Credential used outside its kind"
            );
            return Err(AuthError::Malformed);
        }

        if decoded.claims.exp <= self.clock.now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(decoded.claims)
    }
}

fn timestamp(secs: i64) -> Result<DateTime<chrono::Utc>, AuthError> {
    DateTime::from_timestamp(secs, 0)
        .context("Invalid timestamp")
        .map_err(AuthError::from)
}
