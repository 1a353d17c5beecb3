//! Credential resolution seam. The ledger stores opaque handles; turning
//! a handle into a usable API key happens behind this trait, so the
//! engine never persists plaintext.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no credential for handle {0:?}")]
    Missing(String),
}

pub trait CredentialStore: Send + Sync {
    fn decrypt(&self, handle: &str) -> Result<String, CredentialError>;
}

/// Resolves a handle as an environment variable name. Suits deployments
/// where keys are injected by the process supervisor.
#[derive(Debug, Default)]
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn decrypt(&self, handle: &str) -> Result<String, CredentialError> {
        std::env::var(handle).map_err(|_| CredentialError::Missing(handle.to_string()))
    }
}

/// In-memory store for tests and local runs.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    entries: HashMap<String, String>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: impl Into<String>, secret: impl Into<String>) {
        self.entries.insert(handle.into(), secret.into());
    }
}

impl CredentialStore for StaticCredentialStore {
    fn decrypt(&self, handle: &str) -> Result<String, CredentialError> {
        self.entries
            .get(handle)
            .cloned()
            .ok_or_else(|| CredentialError::Missing(handle.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_store_resolves_known_handles() {
        let mut store = StaticCredentialStore::new();
        store.insert("openai_prod", "sk-test");
        assert_eq!(store.decrypt("openai_prod").unwrap(), "sk-test");
        assert!(matches!(
            store.decrypt("unknown"),
            Err(CredentialError::Missing(_))
        ));
    }
}
