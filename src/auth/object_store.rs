//! Per-identity storage namespaces

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info};

pub trait ObjectStore: Send + Sync {
    /// Create the identity's namespace. Idempotent.
    fn create_namespace(&self, user_id: i64) -> Result<()>;

    /// Remove the namespace and everything under it. Missing is not an error.
    fn delete_namespace(&self, user_id: i64) -> Result<()>;
}

/// Filesystem-backed store: one directory per identity under `root/reports`
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn namespace_path(&self, user_id: i64) -> PathBuf {
        self.root.join("reports").join(format!("user-{user_id}"))
    }
}

impl ObjectStore for LocalObjectStore {
    fn create_namespace(&self, user_id: i64) -> Result<()> {
        let dir = self.namespace_path(user_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create namespace {}", dir.display()))?;

        let marker = dir.join(".init");
        if !marker.exists() {
            fs::write(&marker, b"")
                .with_context(|| format!("Failed to write {}", marker.display()))?;
            info!(user_id, path = %dir.display(), "Created storage namespace");
        }
        Ok(())
    }

    fn delete_namespace(&self, user_id: i64) -> Result<()> {
        let dir = self.namespace_path(user_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(user_id, path = %dir.display(), "Deleted storage namespace");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(user_id, "No storage namespace to delete");
                Ok(())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to delete namespace {}", dir.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path());

        store.create_namespace(7).unwrap();
        store.create_namespace(7).unwrap();
        assert!(store.namespace_path(7).join(".init").exists());
    }

    #[test]
    fn test_delete_removes_contents_and_tolerates_missing() {
        let tmp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path());

        store.create_namespace(7).unwrap();
        fs::write(store.namespace_path(7).join("report-1"), b"data").unwrap();

        store.delete_namespace(7).unwrap();
        assert!(!store.namespace_path(7).exists());
        store.delete_namespace(7).unwrap();
    }
}
