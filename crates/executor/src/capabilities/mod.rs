//! Capability interfaces between the step executor and the host.
//!
//! The orchestration core never builds shell strings from user input: all
//! external invocation uses argument vectors, SQL uses bound parameters,
//! and secrets travel by opaque handle.

pub mod command;
pub mod database;
pub mod fs;
pub mod secrets;

use thiserror::Error;

/// Errors raised at the capability boundary.
///
/// Deliberately free of process output: a failed command is reported by
/// program name, never by echoing stdout/stderr that could carry secrets.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// An external call exceeded its deadline.
    #[error("'{program}' timed out after {timeout_secs}s")]
    Timeout { program: String, timeout_secs: u64 },

    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A secret handle did not resolve to a stored value.
    #[error("Unknown secret handle")]
    UnknownSecret,
}
