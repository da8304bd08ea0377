//! Authentication Module
//! Mission: Credentials, refresh sessions and one-time account tokens

pub mod api;
pub mod error;
pub mod jwt;
pub mod mailer;
pub mod middleware;
pub mod models;
pub mod object_store;
pub mod password;
pub mod refresh;
pub mod secrets;
pub mod service;
pub mod sqlite_store;
pub mod store;
pub mod verification;

pub use api::{router, AuthState};
pub use error::AuthError;
pub use jwt::CredentialSigner;
pub use middleware::{authenticate, AuthGate, CurrentUser};
pub use refresh::RefreshLedger;
pub use service::{AccountService, LoginOutcome, Notifier};
pub use sqlite_store::SqliteAuthStore;
pub use store::{AccountEffect, RefreshStore, UserStore, VerificationStore};
pub use verification::{Redemption, ResendOutcome, VerificationMachine};
