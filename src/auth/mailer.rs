//! Outbound mail
//!
//! Transport is a black box behind [`Mailer`]. The auth core only renders the
//! HTML bodies: each embeds the token and the purpose as hidden fields of a
//! form that posts straight back to the redemption endpoint.

use crate::auth::models::TokenPurpose;
use anyhow::Result;
use parking_lot::Mutex;
use tracing::info;

pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()>;
}

/// Writes mail to the log instead of delivering it
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
        info!(to, subject, bytes = html_body.len(), "Outbound email");
        tracing::debug!(body = html_body, "Outbound email body");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Keeps every message in memory; used by tests and local runs
#[derive(Debug, Default)]
pub struct MemoryMailer {
    outbox: Mutex<Vec<SentMail>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.outbox.lock().clone()
    }

    pub fn last_to(&self, to: &str) -> Option<SentMail> {
        self.outbox.lock().iter().rev().find(|m| m.to == to).cloned()
    }
}

impl Mailer for MemoryMailer {
    fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
        self.outbox.lock().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html_body: html_body.to_string(),
        });
        Ok(())
    }
}

/// Renders the per-purpose subject and body
#[derive(Debug, Clone)]
pub struct EmailTemplates {
    base_url: String,
}

struct Template {
    subject: &'static str,
    heading: &'static str,
    heading_color: &'static str,
    intro: &'static str,
    button: &'static str,
    button_color: &'static str,
    path: &'static str,
}

impl EmailTemplates {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn template(purpose: TokenPurpose) -> Template {
        match purpose {
            TokenPurpose::EmailVerification => Template {
                subject: "Account Verification - Finance Freedom",
                heading: "Welcome to Finance Freedom!",
                heading_color: "#333",
                intro: "Confirm your email address with the button below.",
                button: "Verify Email",
                button_color: "#007bff",
                path: "/api/auth/verify",
            },
            TokenPurpose::AccountDeletion => Template {
                subject: "Account deletion - Finance Freedom",
                heading: "Confirm Account Deletion",
                heading_color: "#d9534f",
                intro: "This permanently removes your account and stored reports.",
                button: "Delete Account",
                button_color: "#dc3545",
                path: "/api/user/verify",
            },
            TokenPurpose::PasswordChange => Template {
                subject: "Password reset - Finance Freedom",
                heading: "Confirm Password Change",
                heading_color: "#333",
                intro: "You asked to change your password. Confirm below to continue.",
                button: "Change Password",
                button_color: "#ffc107",
                path: "/api/user/verify",
            },
            TokenPurpose::PasswordReset => Template {
                subject: "Password Reset - Finance Freedom",
                heading: "Reset Your Password",
                heading_color: "#333",
                intro: "A password reset was requested for this address.",
                button: "Reset Password",
                button_color: "#17a2b8",
                path: "/api/user/verify",
            },
        }
    }

    /// Returns `(subject, html_body)` for a token of `purpose`
    pub fn render(&self, purpose: TokenPurpose, token: &str) -> (String, String) {
        let t = Self::template(purpose);
        let body = format!(
            "<html><body style='font-family: Arial, sans-serif;'>\
             <div style='background-color: #f5f5f5; padding: 20px;'>\
             <h2 style='color: {heading_color};'>{heading}</h2>\
             <p style='font-size: 16px;'>{intro}</p>\
             <form method='POST' action='{base}{path}'>\
             <input type='hidden' name='token' value='{token}'>\
             <input type='hidden' name='purpose' value='{purpose}'>\
             <button type='submit' style='padding: 10px 20px; background-color: {button_color}; \
             color: white; border: none; border-radius: 5px; cursor: pointer;'>{button}</button>\
             </form></div></body></html>",
            heading_color = t.heading_color,
            heading = t.heading,
            intro = t.intro,
            base = self.base_url,
            path = t.path,
            token = token,
            purpose = purpose.as_str(),
            button_color = t.button_color,
            button = t.button,
        );
        (t.subject.to_string(), body)
    }
}
