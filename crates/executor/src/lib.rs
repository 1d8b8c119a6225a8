//! The side-effect layer of the provisioning system.
//!
//! Every interaction with the operating environment happens behind the
//! capability traits in [`capabilities`]: external commands run as argument
//! vectors with timeouts, SQL statements bind their parameters, files go
//! through a narrow filesystem interface, and generated credentials live
//! only in the secret store. The [`StepExecutor`] interprets workflow
//! action specs in terms of those capabilities, which is what lets the
//! orchestrator above it run against fakes in tests.

pub mod capabilities;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod retry;

pub use capabilities::command::{
    CommandOutput, CommandRunner, InMemoryCommandRunner, SystemCommandRunner,
};
pub use capabilities::database::{DatabaseAdmin, InMemoryDatabaseAdmin, MySqlDatabaseAdmin};
pub use capabilities::fs::{FileSystem, InMemoryFileSystem, SystemFileSystem};
pub use capabilities::secrets::{
    InMemorySecretStore, SecretHandle, SecretStore, generate_credential,
};
pub use capabilities::CapabilityError;
pub use config::ExecutorConfig;
pub use context::StepContext;
pub use error::StepError;
pub use executor::{Executor, StepExecutor};
pub use retry::RetryPolicy;
