//! Resource ledger entries.

use chrono::{DateTime, Utc};
use common::RunId;
use serde::{Deserialize, Serialize};

/// The kind of resource a ledger entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Domain,
    Database,
    Certificate,
    AppInstall,
    EmailAccount,
}

impl ResourceKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Domain => "domain",
            ResourceKind::Database => "database",
            ResourceKind::Certificate => "certificate",
            ResourceKind::AppInstall => "app_install",
            ResourceKind::EmailAccount => "email_account",
        }
    }

    /// Parses a kind from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "domain" => Some(ResourceKind::Domain),
            "database" => Some(ResourceKind::Database),
            "certificate" => Some(ResourceKind::Certificate),
            "app_install" => Some(ResourceKind::AppInstall),
            "email_account" => Some(ResourceKind::EmailAccount),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The lifecycle status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// The owning step is currently provisioning the resource.
    Pending,

    /// The resource exists on the host.
    Active,

    /// Provisioning or compensation failed; requires operator attention.
    Failed,

    /// The resource was removed by a compensating action.
    RolledBack,
}

impl ResourceStatus {
    /// A live entry counts toward natural-key uniqueness.
    pub fn is_live(&self) -> bool {
        !matches!(self, ResourceStatus::RolledBack)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Active => "active",
            ResourceStatus::Failed => "failed",
            ResourceStatus::RolledBack => "rolled_back",
        }
    }

    /// Parses a status from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResourceStatus::Pending),
            "active" => Some(ResourceStatus::Active),
            "failed" => Some(ResourceStatus::Failed),
            "rolled_back" => Some(ResourceStatus::RolledBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable record of one provisioned resource.
///
/// The natural key (domain name, database name, email address) is unique
/// among entries that are not `rolled_back`; that uniqueness is the basis
/// of idempotency and of "already exists" checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLedgerEntry {
    /// What kind of resource this is.
    pub kind: ResourceKind,

    /// Natural key, e.g. `example.com` or `wp_example`.
    pub natural_key: String,

    /// Current lifecycle status.
    pub status: ResourceStatus,

    /// The workflow run that provisioned this resource.
    pub run_id: RunId,

    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl ResourceLedgerEntry {
    /// Creates a pending entry owned by the given run.
    pub fn pending(kind: ResourceKind, natural_key: impl Into<String>, run_id: RunId) -> Self {
        Self {
            kind,
            natural_key: natural_key.into(),
            status: ResourceStatus::Pending,
            run_id,
            created_at: Utc::now(),
        }
    }
}
