//! Authentication Errors
//! Mission: One typed taxonomy for every recoverable auth outcome

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Errors surfaced by the signer, ledgers, token machine, gate and rate limiter.
///
/// Everything except `Internal` is an expected outcome the caller can react to.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token does not match the expected purpose")]
    PurposeMismatch,
    #[error("resource is owned by another identity")]
    OwnershipMismatch,
    #[error("invalid credentials")]
    AuthFailure,
    #[error("too many {action} attempts")]
    QuotaExceeded { action: String },
    #[error("malformed or badly signed credential")]
    Malformed,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("account is not verified")]
    NotVerified,
    #[error("authentication required")]
    Unauthenticated,
    #[error("email already registered")]
    EmailTaken,
    #[error("password must be at least {0} characters")]
    WeakPassword(usize),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable code for response bodies and logs
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::NotFound => "not_found",
            AuthError::Expired => "expired",
            AuthError::PurposeMismatch => "purpose_mismatch",
            AuthError::OwnershipMismatch => "access_denied",
            AuthError::AuthFailure => "auth_failure",
            AuthError::QuotaExceeded { .. } => "quota_exceeded",
            AuthError::Malformed => "malformed",
            AuthError::MissingField(_) => "missing_field",
            AuthError::NotVerified => "not_verified",
            AuthError::Unauthenticated => "unauthenticated",
            AuthError::EmailTaken => "email_taken",
            AuthError::WeakPassword(_) => "weak_password",
            AuthError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::NotFound
            | AuthError::PurposeMismatch
            | AuthError::MissingField(_)
            | AuthError::WeakPassword(_) => StatusCode::BAD_REQUEST,
            AuthError::Expired
            | AuthError::Malformed
            | AuthError::AuthFailure
            | AuthError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AuthError::OwnershipMismatch | AuthError::NotVerified => StatusCode::FORBIDDEN,
            AuthError::EmailTaken => StatusCode::CONFLICT,
            AuthError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show an unauthenticated caller
    fn public_message(&self) -> String {
        match self {
            AuthError::OwnershipMismatch => "Access denied".to_string(),
            AuthError::QuotaExceeded { action } => {
                format!("Too many {} attempts. Please try again later.", action)
            }
            AuthError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let AuthError::Internal(ref e) = self {
            error!(error = %format!("{e:#}"), "Auth request failed");
        }

        let body = json!({
            "error": self.code(),
            "message": self.public_message(),
        });

        (self.status(), Json(body)).into_response()
    }
}
