//! Workflow definition types.
//!
//! Everything in this module is pure data. A definition lists steps in
//! execution order; each step names its forward action, its compensating
//! action, the prior outputs it consumes, and how the engine should treat
//! failures (retryable or not) and time (per-step timeout).

use std::time::Duration;

use ledger::ResourceKind;

/// Default timeout for local DB, file, and command operations.
pub const LOCAL_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for package downloads and certificate issuance.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// An atomic provisioning action the step executor knows how to perform.
///
/// Compensations are plain actions too; a step's `compensation` field is
/// what marks an action as the inverse of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSpec {
    /// `CREATE DATABASE IF NOT EXISTS`; generates the run's DB credential.
    CreateDatabase,
    /// `DROP DATABASE IF EXISTS`.
    DropDatabase,
    /// `CREATE USER IF NOT EXISTS` with the generated credential.
    CreateDbUser,
    /// `DROP USER IF EXISTS`.
    DropDbUser,
    /// `GRANT ALL PRIVILEGES` on the database to the user.
    GrantPrivileges,
    /// Fetches the application release archive into the scratch directory.
    DownloadRelease,
    /// Removes the downloaded archive.
    RemoveDownload,
    /// Unpacks the archive into the domain's document root.
    ExtractAndPlaceFiles,
    /// Removes the application files from the document root.
    RemoveSiteFiles,
    /// Writes the application config file with DB credentials and salts.
    WriteAppConfig,
    /// Sets web-server ownership and modes on the document root.
    SetPermissions,
    /// Creates the domain's document root directory.
    CreateDocumentRoot,
    /// Removes the document root directory.
    RemoveDocumentRoot,
    /// Writes a static placeholder index page.
    WriteWelcomePage,
    /// Writes the web server virtual-host config for the domain.
    WriteVhostConfig,
    /// Removes the virtual-host config.
    RemoveVhostConfig,
    /// Enables the site and reloads the web server.
    EnableSite,
    /// Disables the site and reloads the web server.
    DisableSite,
    /// Creates the mail system user.
    CreateSystemUser,
    /// Removes the mail system user.
    RemoveSystemUser,
    /// Creates the account's maildir and sets mail ownership.
    CreateMaildir,
    /// Removes the maildir.
    RemoveMaildir,
    /// Adds the address to the postfix virtual map and rebuilds it.
    RegisterPostfixMap,
    /// Removes the address from the postfix virtual map and rebuilds it.
    UnregisterPostfixMap,
    /// Adds the account to the dovecot users file.
    RegisterDovecotUser,
    /// Removes the account from the dovecot users file.
    UnregisterDovecotUser,
    /// Reloads postfix and dovecot.
    ReloadMailServices,
    /// Requests a certificate from the ACME client.
    RequestCertificate,
    /// Deletes the certificate via the ACME client.
    RevokeCertificate,
    /// No side effect; the engine writes the ledger entry for this step.
    RecordResource,
}

/// A ledger resource a step provisions, keyed by a request parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpec {
    /// The kind of ledger entry to record.
    pub kind: ResourceKind,
    /// Request parameter holding the natural key, e.g. `domain`.
    pub key_param: &'static str,
}

/// A check the engine performs against the ledger before admitting a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// A live ledger entry of this kind must exist for the keyed parameter.
    ResourceActive {
        kind: ResourceKind,
        key_param: &'static str,
    },
}

/// One step of a workflow definition.
#[derive(Debug, Clone)]
pub struct StepDef {
    /// Step name; also the key for its record in the persisted run.
    pub name: &'static str,
    /// Forward action.
    pub action: ActionSpec,
    /// Inverse action, run during rollback once this step reached `done`.
    pub compensation: Option<ActionSpec>,
    /// Whether transient failures of the forward action may be retried.
    pub retryable: bool,
    /// Deadline for a single forward attempt.
    pub timeout: Duration,
    /// Steps sharing a group run concurrently; `None` means sequential.
    pub parallel_group: Option<&'static str>,
    /// Ledger entry this step provisions, if any.
    pub records: Option<ResourceSpec>,
    /// Names of prior steps whose outputs this step reads.
    pub consumes: &'static [&'static str],
}

impl StepDef {
    /// Creates a sequential, non-retryable step with the local-op timeout.
    pub fn new(name: &'static str, action: ActionSpec) -> Self {
        Self {
            name,
            action,
            compensation: None,
            retryable: false,
            timeout: LOCAL_OP_TIMEOUT,
            parallel_group: None,
            records: None,
            consumes: &[],
        }
    }

    /// Sets the compensating action.
    pub fn compensated_by(mut self, action: ActionSpec) -> Self {
        self.compensation = Some(action);
        self
    }

    /// Marks transient failures as retryable.
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Overrides the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Assigns the step to a parallel group.
    pub fn in_group(mut self, group: &'static str) -> Self {
        self.parallel_group = Some(group);
        self
    }

    /// Declares the ledger resource this step provisions.
    pub fn records(mut self, kind: ResourceKind, key_param: &'static str) -> Self {
        self.records = Some(ResourceSpec { kind, key_param });
        self
    }

    /// Declares which prior steps' outputs this step consumes.
    pub fn consumes(mut self, steps: &'static [&'static str]) -> Self {
        self.consumes = steps;
        self
    }
}

/// A versioned, ordered list of steps for one provisioning operation.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    /// Workflow name, e.g. `install_wordpress`.
    pub name: &'static str,
    /// Definition version; bumped when the step list changes.
    pub version: u16,
    /// Steps in execution order.
    pub steps: Vec<StepDef>,
    /// Ledger checks performed before a run is admitted.
    pub preconditions: Vec<Precondition>,
}

impl WorkflowDefinition {
    /// Returns the step names in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    /// Returns the step definition with the given name.
    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.name == name)
    }
}
