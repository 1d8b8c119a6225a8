use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::RunId;
use tokio::sync::RwLock;

use crate::{
    LedgerError, Result,
    entry::{ResourceKind, ResourceLedgerEntry, ResourceStatus},
    run::{RunStatus, WorkflowRun},
    store::{Admission, ProvisionStore},
};

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, WorkflowRun>,
    resources: Vec<ResourceLedgerEntry>,
}

/// In-memory store implementation for testing and single-node use.
///
/// Holds runs and the resource ledger behind a single lock so that
/// admission and natural-key checks are atomic, matching the guarantees
/// of the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of runs stored.
    pub async fn run_count(&self) -> usize {
        self.inner.read().await.runs.len()
    }

    /// Returns the total number of ledger entries.
    pub async fn resource_count(&self) -> usize {
        self.inner.read().await.resources.len()
    }
}

#[async_trait]
impl ProvisionStore for InMemoryStore {
    async fn admit(&self, run: WorkflowRun) -> Result<Admission> {
        let mut inner = self.inner.write().await;

        // The whole check-and-insert happens under one write lock, so two
        // concurrent admissions for the same key serialize here.
        for existing in inner.runs.values() {
            if existing.operation_key != run.operation_key {
                continue;
            }
            match existing.status {
                RunStatus::Running => return Ok(Admission::AlreadyInFlight(existing.id)),
                RunStatus::Succeeded => {
                    return Ok(Admission::AlreadyCompleted {
                        run_id: existing.id,
                        result: existing.result.clone(),
                    });
                }
                RunStatus::RolledBack | RunStatus::Failed => {}
            }
        }

        let id = run.id;
        inner.runs.insert(id, run);
        Ok(Admission::AdmittedNew(id))
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>> {
        let inner = self.inner.read().await;
        Ok(inner.runs.get(&id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<_> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn stalled_runs(&self, idle_for: Duration) -> Result<Vec<WorkflowRun>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_for).unwrap_or_else(|_| chrono::Duration::zero());
        let inner = self.inner.read().await;
        let mut runs: Vec<_> = inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running && r.updated_at < cutoff)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(runs)
    }

    async fn request_cancel(&self, id: RunId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let run = inner.runs.get_mut(&id).ok_or(LedgerError::RunNotFound(id))?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.cancel_requested = true;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_resource(&self, entry: ResourceLedgerEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        let duplicate = inner
            .resources
            .iter()
            .any(|e| e.kind == entry.kind && e.natural_key == entry.natural_key && e.status.is_live());
        if duplicate {
            return Err(LedgerError::DuplicateResource {
                kind: entry.kind,
                natural_key: entry.natural_key,
            });
        }
        inner.resources.push(entry);
        Ok(())
    }

    async fn set_resource_status(
        &self,
        kind: ResourceKind,
        natural_key: &str,
        status: ResourceStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner
            .resources
            .iter_mut()
            .rev()
            .find(|e| e.kind == kind && e.natural_key == natural_key && e.status.is_live())
        {
            entry.status = status;
        }
        Ok(())
    }

    async fn lookup(
        &self,
        kind: ResourceKind,
        natural_key: &str,
    ) -> Result<Option<ResourceLedgerEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .iter()
            .rev()
            .find(|e| e.kind == kind && e.natural_key == natural_key && e.status.is_live())
            .cloned())
    }

    async fn resources_for_run(&self, run_id: RunId) -> Result<Vec<ResourceLedgerEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_resources(&self, kind: Option<ResourceKind>) -> Result<Vec<ResourceLedgerEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .iter()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .cloned()
            .collect())
    }
}
