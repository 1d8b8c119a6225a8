//! Engine error types.

use common::RunId;
use ledger::{LedgerError, ResourceKind, RunStatus};
use thiserror::Error;
use workflow::ValidationError;

/// Errors that can occur while orchestrating a provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The request was rejected before a run was created.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A precondition resource is missing from the ledger.
    #[error("Required {kind} '{natural_key}' not found")]
    MissingDependency {
        kind: ResourceKind,
        natural_key: String,
    },

    /// The run does not exist.
    #[error("Workflow run not found: {0}")]
    RunNotFound(RunId),

    /// The run is terminal and cannot be resumed.
    #[error("Run {run_id} is {status} and cannot be resumed")]
    NotResumable { run_id: RunId, status: RunStatus },

    /// A persisted run references a workflow no longer in the catalog.
    #[error("Unknown workflow '{0}' in persisted run")]
    UnknownWorkflow(String),

    /// A compensation failed; the ledger is partially rolled back and
    /// requires operator attention.
    #[error("Compensation for step '{step}' failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    /// A store error occurred.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
