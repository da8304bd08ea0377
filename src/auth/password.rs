//! Password hashing (bcrypt)

use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};

/// Minimum accepted password length on registration and password change
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    cost: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self { cost: DEFAULT_COST }
    }
}

impl PasswordHasher {
    /// bcrypt accepts costs 4..=31; out-of-range values are clamped
    pub fn with_cost(cost: u32) -> Self {
        Self {
            cost: cost.clamp(4, 31),
        }
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        hash(password, self.cost).context("Failed to hash password")
    }

    pub fn verify(&self, password: &str, password_hash: &str) -> Result<bool> {
        verify(password, password_hash).context("Failed to verify password")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = PasswordHasher::with_cost(4);
        let hashed = hasher.hash("correct horse").unwrap();

        assert_ne!(hashed, "correct horse");
        assert!(hasher.verify("correct horse", &hashed).unwrap());
        assert!(!hasher.verify("wrong horse", &hashed).unwrap());
    }

    #[test]
    fn test_cost_is_clamped() {
        let hasher = PasswordHasher::with_cost(1);
        assert!(hasher.hash("password123").is_ok());
    }
}
