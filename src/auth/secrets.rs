//! Secret Provider
//! Mission: Hand the signer its current key without re-reading the source on every request

use anyhow::{bail, Result};
use parking_lot::RwLock;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

/// HS256 keys shorter than this are accepted but logged.
const MIN_KEY_LEN: usize = 32;

/// Source of signing material
pub trait SecretProvider: Send + Sync {
    /// Current symmetric signing key
    fn signing_key(&self) -> Result<Arc<[u8]>>;
}

/// Fixed key, used by tests and embedded setups
pub struct StaticSecret {
    key: Arc<[u8]>,
}

impl StaticSecret {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Arc::from(key.as_ref()),
        }
    }
}

impl SecretProvider for StaticSecret {
    fn signing_key(&self) -> Result<Arc<[u8]>> {
        Ok(self.key.clone())
    }
}

/// Reads the key from an environment variable once and caches it.
///
/// `invalidate` drops the cached value so the next lookup picks up a rotated key.
pub struct EnvSecretProvider {
    var: String,
    fallback: Option<String>,
    cache: RwLock<Option<Arc<[u8]>>>,
}

impl EnvSecretProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            fallback: None,
            cache: RwLock::new(None),
        }
    }

    /// Key used when the variable is unset (development only)
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    fn load(&self) -> Result<Arc<[u8]>> {
        let raw = match env::var(&self.var) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => match &self.fallback {
                Some(fallback) => {
                    warn!(var = %self.var, "Signing key not set, using development fallback");
                    fallback.clone()
                }
                None => bail!("signing key {} is not configured", self.var),
            },
        };

        if raw.len() < MIN_KEY_LEN {
            warn!(
                var = %self.var,
                len = raw.len(),
                "Signing key shorter than {} bytes", MIN_KEY_LEN
            );
        }

        info!(var = %self.var, "Signing key loaded");
        Ok(Arc::from(raw.into_bytes()))
    }
}

impl SecretProvider for EnvSecretProvider {
    fn signing_key(&self) -> Result<Arc<[u8]>> {
        if let Some(key) = self.cache.read().as_ref() {
            return Ok(key.clone());
        }

        let mut cache = self.cache.write();
        if let Some(key) = cache.as_ref() {
            return Ok(key.clone());
        }
        let key = self.load()?;
        *cache = Some(key.clone());
        Ok(key)
    }
}
