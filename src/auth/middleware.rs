//! Authentication Gate
//! Mission: Resolve the bearer credential to a fresh identity once per request

use crate::auth::error::AuthError;
use crate::auth::jwt::CredentialSigner;
use crate::auth::models::{CredentialKind, Identity};
use crate::auth::store::UserStore;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity attached to the request by the gate
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

pub struct AuthGate {
    signer: Arc<CredentialSigner>,
    users: Arc<dyn UserStore>,
}

impl AuthGate {
    pub fn new(signer: Arc<CredentialSigner>, users: Arc<dyn UserStore>) -> Self {
        Self { signer, users }
    }

    /// `Ok(None)` when no bearer credential is present.
    ///
    /// Claims only name the subject; the active flag and existence are always
    /// read back from the user store.
    pub fn authenticate_header(&self, header: Option<&str>) -> Result<Option<Identity>, AuthError> {
        let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
            return Ok(None);
        };

        let claims = self.signer.verify(token.trim(), CredentialKind::Access)?;
        let subject = claims.subject_id().ok_or(AuthError::Malformed)?;

        match self.users.find_by_email(&claims.email)? {
            Some(identity) if identity.id == subject && identity.active => Ok(Some(identity)),
            _ => {
                debug!(subject, "Credential subject no longer resolves to an active user");
                Err(AuthError::Unauthenticated)
            }
        }
    }
}

/// Attach `CurrentUser` when a valid bearer credential is present.
///
/// Requests without a credential pass through untouched; protected handlers
/// reject them via the `CurrentUser` extractor.
pub async fn authenticate(
    State(gate): State<Arc<AuthGate>>,
    mut req: Request,
    next: Next,
) -> Response {
    if req.extensions().get::<CurrentUser>().is_none() {
        let header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok());

        match gate.authenticate_header(header) {
            Ok(Some(identity)) => {
                req.extensions_mut().insert(CurrentUser(identity));
            }
            Ok(None) => {}
            Err(err) => {
                match err {
                    AuthError::Expired => info!(path = %req.uri().path(), "Expired credential"),
                    AuthError::Malformed => warn!(path = %req.uri().path(), "Malformed credential"),
                    ref other => debug!(path = %req.uri().path(), error = %other, "Credential rejected"),
                }
                return err.into_response();
            }
        }
    }

    next.run(req).await
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::Unauthenticated)
    }
}
