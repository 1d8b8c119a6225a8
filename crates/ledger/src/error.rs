use common::RunId;
use thiserror::Error;

use crate::entry::ResourceKind;

/// Errors that can occur when interacting with the provisioning store.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The workflow run was not found in the store.
    #[error("Workflow run not found: {0}")]
    RunNotFound(RunId),

    /// A live ledger entry with the same natural key already exists.
    #[error("Resource {kind} '{natural_key}' already exists")]
    DuplicateResource {
        kind: ResourceKind,
        natural_key: String,
    },

    /// A stored row contained a value that no longer parses.
    #[error("Invalid {field} value '{value}' in stored row")]
    InvalidColumn { field: &'static str, value: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
