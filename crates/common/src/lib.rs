//! Shared types used across the provisioning system.

mod types;

pub use types::{OperationKey, RunId};
