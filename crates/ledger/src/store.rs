use std::time::Duration;

use async_trait::async_trait;
use common::RunId;

use crate::{Result, run::WorkflowRun};
use crate::entry::{ResourceKind, ResourceLedgerEntry, ResourceStatus};

/// Outcome of admitting an operation through the idempotency guard.
#[derive(Debug, Clone)]
pub enum Admission {
    /// No live run held the key; the supplied run was persisted and owns it.
    AdmittedNew(RunId),

    /// A run for the same key is still in progress.
    AlreadyInFlight(RunId),

    /// A prior run for the same key succeeded; its result is returned.
    AlreadyCompleted {
        run_id: RunId,
        result: Option<serde_json::Value>,
    },
}

impl Admission {
    /// Returns the run ID this admission resolved to.
    pub fn run_id(&self) -> RunId {
        match self {
            Admission::AdmittedNew(id) | Admission::AlreadyInFlight(id) => *id,
            Admission::AlreadyCompleted { run_id, .. } => *run_id,
        }
    }

    /// Returns true if the supplied run was admitted as new.
    pub fn is_new(&self) -> bool {
        matches!(self, Admission::AdmittedNew(_))
    }
}

/// Core trait for provisioning-store implementations.
///
/// Holds both workflow runs and the resource ledger so that admission can be
/// a single atomic operation. All implementations must be thread-safe.
#[async_trait]
pub trait ProvisionStore: Send + Sync {
    /// Atomically admits a run under its operation key.
    ///
    /// Exactly one of two concurrent admissions for the same key may return
    /// `AdmittedNew`; the other observes `AlreadyInFlight` (or
    /// `AlreadyCompleted` when a prior run succeeded). Runs that ended
    /// `rolled_back` or `failed` release the key.
    async fn admit(&self, run: WorkflowRun) -> Result<Admission>;

    /// Persists the current state of a run.
    ///
    /// Called after every step transition; the stored snapshot is what a
    /// restart resumes from.
    async fn save_run(&self, run: &WorkflowRun) -> Result<()>;

    /// Retrieves a run by ID.
    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>>;

    /// Lists all runs, newest first.
    async fn list_runs(&self) -> Result<Vec<WorkflowRun>>;

    /// Returns `running` runs that have made no progress for at least
    /// `idle_for`, oldest first. Used by the crash-recovery sweep.
    async fn stalled_runs(&self, idle_for: Duration) -> Result<Vec<WorkflowRun>>;

    /// Requests cancellation of a run.
    ///
    /// Returns true if the flag was set, false if the run is already
    /// terminal. The orchestrator observes the flag between steps.
    async fn request_cancel(&self, id: RunId) -> Result<bool>;

    /// Inserts a ledger entry.
    ///
    /// Fails with `DuplicateResource` if a live entry (any status other
    /// than `rolled_back`) already holds the same kind + natural key.
    async fn record_resource(&self, entry: ResourceLedgerEntry) -> Result<()>;

    /// Updates the status of the live entry for the given kind + key.
    ///
    /// A no-op if no live entry exists.
    async fn set_resource_status(
        &self,
        kind: ResourceKind,
        natural_key: &str,
        status: ResourceStatus,
    ) -> Result<()>;

    /// Looks up the live entry for a kind + natural key.
    async fn lookup(
        &self,
        kind: ResourceKind,
        natural_key: &str,
    ) -> Result<Option<ResourceLedgerEntry>>;

    /// Returns all entries owned by a run, in insertion order.
    async fn resources_for_run(&self, run_id: RunId) -> Result<Vec<ResourceLedgerEntry>>;

    /// Lists ledger entries, optionally filtered by kind, in insertion order.
    async fn list_resources(&self, kind: Option<ResourceKind>) -> Result<Vec<ResourceLedgerEntry>>;
}
