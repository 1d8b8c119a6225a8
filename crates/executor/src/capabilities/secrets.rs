//! Opaque storage for credentials generated during provisioning.
//!
//! Generated passwords and salts never appear in run records, the ledger,
//! or logs; step outputs carry only the handle returned by [`SecretStore::put`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CapabilityError;

/// Opaque reference to a stored secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretHandle(Uuid);

impl SecretHandle {
    /// Creates a new random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SecretHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait for the secret-store collaborator.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Stores a secret value and returns its handle.
    async fn put(&self, value: String) -> Result<SecretHandle, CapabilityError>;

    /// Resolves a handle back to its value.
    async fn reveal(&self, handle: SecretHandle) -> Result<String, CapabilityError>;
}

/// In-memory secret store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySecretStore {
    secrets: Arc<RwLock<HashMap<SecretHandle, String>>>,
}

impl InMemorySecretStore {
    /// Creates a new empty secret store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored secrets.
    pub fn secret_count(&self) -> usize {
        self.secrets.read().unwrap().len()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn put(&self, value: String) -> Result<SecretHandle, CapabilityError> {
        let handle = SecretHandle::new();
        self.secrets.write().unwrap().insert(handle, value);
        Ok(handle)
    }

    async fn reveal(&self, handle: SecretHandle) -> Result<String, CapabilityError> {
        self.secrets
            .read()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(CapabilityError::UnknownSecret)
    }
}

/// Generates a random alphanumeric credential of the given length.
pub fn generate_credential(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
