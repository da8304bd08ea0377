//! Authentication Models
//! Mission: Define identities, credentials and one-time tokens

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// User account as held by the user store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub email: String,
    pub full_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // bcrypt hash - never serialize
    pub verified: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Fields required to create an identity; the store assigns the id
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// JWT Claims payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String, // subject (identity id)
    pub email: String,
    pub username: String, // display name
    pub iat: i64,
    pub exp: i64, // expiration timestamp (seconds)
    pub jti: String, // unique per issued credential
    pub typ: CredentialKind,
}

impl Claims {
    /// Subject parsed back into an identity id
    pub fn subject_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

/// What a signed credential may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// Bearer credential accepted by the gate
    Access,
    /// Only exchangeable at the refresh ledger
    Refresh,
}

/// Signed access credential handed to the caller, never stored
#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Persisted long-lived refresh credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRecord {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Persisted single-use verification token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationToken {
    pub id: i64,
    pub token: String,
    pub user_id: i64,
    pub purpose: TokenPurpose,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Sensitive action a verification token authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenPurpose {
    EmailVerification,
    AccountDeletion,
    PasswordChange,
    PasswordReset,
}

impl TokenPurpose {
    pub const ALL: [TokenPurpose; 4] = [
        TokenPurpose::EmailVerification,
        TokenPurpose::AccountDeletion,
        TokenPurpose::PasswordChange,
        TokenPurpose::PasswordReset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::EmailVerification => "EMAIL_VERIFICATION",
            TokenPurpose::AccountDeletion => "ACCOUNT_DELETION",
            TokenPurpose::PasswordChange => "PASSWORD_CHANGE",
            TokenPurpose::PasswordReset => "PASSWORD_RESET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMAIL_VERIFICATION" => Some(TokenPurpose::EmailVerification),
            "ACCOUNT_DELETION" => Some(TokenPurpose::AccountDeletion),
            "PASSWORD_CHANGE" => Some(TokenPurpose::PasswordChange),
            "PASSWORD_RESET" => Some(TokenPurpose::PasswordReset),
            _ => None,
        }
    }

    /// Message returned to the caller after a successful redemption
    pub fn success_message(&self) -> &'static str {
        match self {
            TokenPurpose::EmailVerification => "Email verified successfully",
            TokenPurpose::AccountDeletion => "Account deleted successfully",
            TokenPurpose::PasswordChange | TokenPurpose::PasswordReset => {
                "Password changed successfully"
            }
        }
    }
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub full_name: String,
    pub password: String,
}

/// Registration response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub message: String,
    pub email: String,
    pub full_name: String,
}

/// Login request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

/// Login response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user_id: i64,
    pub email: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// Body for refresh and logout
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

/// Fresh access credential returned by refresh
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Body for endpoints keyed by email (password reset, resend verification)
#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

/// Form posted back from the emailed verification links
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyForm {
    pub token: String,
    pub purpose: TokenPurpose,
    #[serde(default)]
    pub new_password: Option<String>,
    #[serde(default)]
    pub old_password: Option<String>,
}

/// Caller details (sanitized)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDetails {
    pub full_name: String,
    pub email: String,
}

impl UserDetails {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            full_name: identity.full_name.clone(),
            email: identity.email.clone(),
        }
    }
}

/// Plain message response
#[derive(Debug, Serialize, Deserialize)]
pub struct GenericResponse {
    pub message: String,
}

impl GenericResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outcome of a token redemption
#[derive(Debug, Serialize)]
pub struct VerificationResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
