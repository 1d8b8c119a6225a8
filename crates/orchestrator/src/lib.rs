//! The saga engine for provisioning workflows.
//!
//! A run moves through its workflow's steps strictly in order (except for
//! declared parallel groups), persisting state after every transition. A
//! step failure triggers compensations for completed steps in reverse
//! order. Admission goes through the idempotency guard, so two requests
//! for the same logical operation can never both provision.

pub mod coordinator;
pub mod error;
pub mod guard;

pub use coordinator::{Orchestrator, ProvisionOutcome};
pub use error::{ProvisionError, Result};
pub use guard::IdempotencyGuard;
