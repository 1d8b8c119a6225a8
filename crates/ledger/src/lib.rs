//! Durable storage for workflow runs and the resource ledger.
//!
//! The ledger is the single source of truth for what has been provisioned
//! on a host. Workflow runs are persisted after every step transition so an
//! interrupted run can be resumed; resource entries enforce natural-key
//! uniqueness for everything that is not rolled back.

pub mod entry;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod run;
pub mod store;

pub use common::{OperationKey, RunId};
pub use entry::{ResourceKind, ResourceLedgerEntry, ResourceStatus};
pub use error::{LedgerError, Result};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use run::{RunStatus, StepRecord, StepStatus, WorkflowRun};
pub use store::{Admission, ProvisionStore};
