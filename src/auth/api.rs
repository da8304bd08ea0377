//! Authentication API Endpoints
//! Mission: Thin HTTP handlers over the account service

use crate::auth::{
    error::AuthError,
    jwt::CredentialSigner,
    mailer::{EmailTemplates, Mailer},
    middleware::{authenticate, AuthGate, CurrentUser},
    models::{
        EmailRequest, GenericResponse, LoginRequest, LoginResponse, RefreshResponse,
        RefreshTokenRequest, RegisterRequest, RegisterResponse, TokenPurpose, UserDetails,
        VerificationResponse, VerifyForm,
    },
    object_store::ObjectStore,
    password::PasswordHasher,
    refresh::RefreshLedger,
    secrets::SecretProvider,
    service::{AccountService, Notifier},
    sqlite_store::SqliteAuthStore,
    verification::{ResendOutcome, VerificationMachine},
};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::middleware::rate_limit::{enforce_quota, QuotaGuard, RateLimitCategory, RateLimiter};
use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Form, Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Shared auth state
#[derive(Clone)]
pub struct AuthState {
    pub service: Arc<AccountService>,
    pub gate: Arc<AuthGate>,
    pub limiter: Arc<RateLimiter>,
}

impl AuthState {
    pub fn new(
        service: Arc<AccountService>,
        gate: Arc<AuthGate>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            service,
            gate,
            limiter,
        }
    }

    /// Wire the whole auth core from configuration and collaborators
    pub fn from_config(
        config: &AppConfig,
        secrets: Arc<dyn SecretProvider>,
        mailer: Arc<dyn Mailer>,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteAuthStore::new(&config.auth_db_path)?);
        let signer = Arc::new(CredentialSigner::new(secrets, clock.clone()));
        let hasher = PasswordHasher::with_cost(config.bcrypt_cost);

        let refresh = Arc::new(RefreshLedger::new(
            store.clone(),
            signer.clone(),
            clock.clone(),
            config.refresh_ttl,
            config.access_ttl,
        ));
        let verification = Arc::new(VerificationMachine::new(
            store.clone(),
            store.clone(),
            objects,
            hasher,
            clock.clone(),
            config.verification_ttl,
        ));
        let service = Arc::new(AccountService::new(
            store.clone(),
            signer.clone(),
            refresh,
            verification,
            Notifier::new(mailer, EmailTemplates::new(config.public_base_url.clone())),
            hasher,
            clock.clone(),
        ));
        let gate = Arc::new(AuthGate::new(signer, store));
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone(), clock));

        Ok(Self::new(service, gate, limiter))
    }
}

/// Run a store-bound service call off the async workers
async fn blocking<T, F>(service: &Arc<AccountService>, f: F) -> Result<T, AuthError>
where
    T: Send + 'static,
    F: FnOnce(&AccountService) -> Result<T, AuthError> + Send + 'static,
{
    let service = service.clone();
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .context("Account task panicked")?
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AuthState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AuthError> {
    let identity = blocking(&state.service, move |s| s.register(&payload)).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully. Please check your email to verify your account."
                .to_string(),
            email: identity.email,
            full_name: identity.full_name,
        }),
    ))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthError> {
    let outcome = blocking(&state.service, move |s| {
        s.login(&payload.email, &payload.password, payload.remember_me)
    })
    .await?;

    Ok(Json(LoginResponse {
        user_id: outcome.identity.id,
        email: outcome.identity.email,
        access_token: outcome.access.token,
        expires_at: outcome.access.expires_at,
        refresh_expires_at: outcome.refresh.as_ref().map(|r| r.expires_at),
        refresh_token: outcome.refresh.map(|r| r.token),
    }))
}

/// POST /api/auth/password-reset
pub async fn request_password_reset(
    State(state): State<AuthState>,
    Json(payload): Json<EmailRequest>,
) -> Result<Json<GenericResponse>, AuthError> {
    blocking(&state.service, move |s| s.request_password_reset(&payload.email)).await?;
    Ok(Json(GenericResponse::new(
        "Password reset email sent. Please check your inbox.",
    )))
}

/// POST /api/auth/resend-verification
pub async fn resend_verification(
    State(state): State<AuthState>,
    Json(payload): Json<EmailRequest>,
) -> Result<Json<GenericResponse>, AuthError> {
    let outcome = blocking(&state.service, move |s| s.resend_verification(&payload.email)).await?;

    let message = match outcome {
        ResendOutcome::Sent(_) => "Verification email has been resent successfully.",
        ResendOutcome::AlreadyVerified => "User already verified",
    };
    Ok(Json(GenericResponse::new(message)))
}

/// POST /api/auth/verify and /api/user/verify (form post-back from emails)
pub async fn verify_token(
    State(state): State<AuthState>,
    Form(form): Form<VerifyForm>,
) -> Result<Json<VerificationResponse>, AuthError> {
    let redemption = blocking(&state.service, move |s| s.redeem_verification(&form)).await?;

    let warning = redemption.side_effect_error.as_ref().map(|e| {
        warn!(user_id = redemption.user_id, error = %e, "Redeemed with failed cleanup");
        "Stored account data could not be removed yet".to_string()
    });

    Ok(Json(VerificationResponse {
        message: redemption.message().to_string(),
        warning,
    }))
}

/// GET /api/user
pub async fn current_user(
    State(state): State<AuthState>,
    CurrentUser(identity): CurrentUser,
) -> Json<UserDetails> {
    Json(state.service.user_details(&identity))
}

/// DELETE /api/user - mails an account deletion token
pub async fn request_account_deletion(
    State(state): State<AuthState>,
    CurrentUser(identity): CurrentUser,
) -> Result<Json<GenericResponse>, AuthError> {
    blocking(&state.service, move |s| {
        s.request_verification(&identity, TokenPurpose::AccountDeletion)
    })
    .await?;
    Ok(Json(GenericResponse::new(
        "Account deletion requested. Please confirm via the email we sent.",
    )))
}

/// POST /api/user/password-change - mails a password change token
pub async fn request_password_change(
    State(state): State<AuthState>,
    CurrentUser(identity): CurrentUser,
) -> Result<Json<GenericResponse>, AuthError> {
    blocking(&state.service, move |s| {
        s.request_verification(&identity, TokenPurpose::PasswordChange)
    })
    .await?;
    Ok(Json(GenericResponse::new(
        "Password change requested. Please confirm via the email we sent.",
    )))
}

/// POST /api/user/refresh
pub async fn refresh(
    State(state): State<AuthState>,
    CurrentUser(identity): CurrentUser,
    Json(payload): Json<RefreshTokenRequest>,
) -> Result<Json<RefreshResponse>, AuthError> {
    let access = blocking(&state.service, move |s| {
        s.refresh(&payload.refresh_token, &identity)
    })
    .await?;

    Ok(Json(RefreshResponse {
        access_token: access.token,
        expires_at: access.expires_at,
    }))
}

/// POST /api/user/logout
pub async fn logout(
    State(state): State<AuthState>,
    CurrentUser(identity): CurrentUser,
    Json(payload): Json<RefreshTokenRequest>,
) -> Result<Json<GenericResponse>, AuthError> {
    blocking(&state.service, move |s| {
        s.logout(&payload.refresh_token, &identity)
    })
    .await?;
    Ok(Json(GenericResponse::new("Logged out successfully")))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Full HTTP surface.
///
/// The gate wraps every route, so per-route quota layers see the identity it
/// attached and key on it instead of the client IP.
pub fn router(state: AuthState) -> Router {
    let limiter = state.limiter.clone();
    let quota = move |category: RateLimitCategory| {
        from_fn_with_state(QuotaGuard::new(limiter.clone(), category), enforce_quota)
    };

    Router::new()
        .route(
            "/api/auth/register",
            post(register).layer(quota(RateLimitCategory::Signup)),
        )
        .route(
            "/api/auth/login",
            post(login).layer(quota(RateLimitCategory::Login)),
        )
        .route(
            "/api/auth/password-reset",
            post(request_password_reset).layer(quota(RateLimitCategory::PasswordReset)),
        )
        .route(
            "/api/auth/verify",
            post(verify_token).layer(quota(RateLimitCategory::VerifyToken)),
        )
        .route(
            "/api/auth/resend-verification",
            post(resend_verification).layer(quota(RateLimitCategory::VerifyToken)),
        )
        .route(
            "/api/user",
            get(current_user)
                .layer(quota(RateLimitCategory::Default))
                .merge(
                    delete(request_account_deletion).layer(quota(RateLimitCategory::DeleteUser)),
                ),
        )
        .route(
            "/api/user/refresh",
            post(refresh).layer(quota(RateLimitCategory::RefreshToken)),
        )
        .route(
            "/api/user/logout",
            post(logout).layer(quota(RateLimitCategory::Default)),
        )
        .route(
            "/api/user/password-change",
            post(request_password_change).layer(quota(RateLimitCategory::PasswordChange)),
        )
        .route(
            "/api/user/verify",
            post(verify_token).layer(quota(RateLimitCategory::VerifyToken)),
        )
        .route("/health", get(health))
        .layer(from_fn_with_state(state.gate.clone(), authenticate))
        .with_state(state)
}
