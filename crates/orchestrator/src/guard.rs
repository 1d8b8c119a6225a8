//! Keyed deduplication of provisioning requests.

use std::collections::BTreeMap;

use ledger::{Admission, ProvisionStore, ResourceStatus, WorkflowRun};
use workflow::{Operation, Precondition, definition_for};

use crate::error::{ProvisionError, Result};

/// Admits provisioning requests exactly once per logical operation.
///
/// Validation and ledger preconditions run first, so a rejected request
/// leaves no trace. Admission itself is a single atomic insert-if-absent
/// against the store, keyed by the derived operation key.
pub struct IdempotencyGuard<S> {
    store: S,
}

impl<S: ProvisionStore> IdempotencyGuard<S> {
    /// Creates a guard over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Validates a request and admits it under its operation key.
    pub async fn admit(
        &self,
        operation: &Operation,
        params: BTreeMap<String, String>,
    ) -> Result<Admission> {
        operation.validate(&params)?;
        let key = operation.operation_key(&params)?;
        let definition = definition_for(operation);

        for precondition in &definition.preconditions {
            let Precondition::ResourceActive { kind, key_param } = precondition;
            let natural_key = params
                .get(*key_param)
                .map(String::as_str)
                .unwrap_or_default();
            let entry = self.store.lookup(*kind, natural_key).await?;
            if !entry.is_some_and(|e| e.status == ResourceStatus::Active) {
                return Err(ProvisionError::MissingDependency {
                    kind: *kind,
                    natural_key: natural_key.to_string(),
                });
            }
        }

        let mut params = params;
        for (name, value) in operation.implicit_params() {
            params.insert(name.to_string(), value.to_string());
        }

        let run = WorkflowRun::new(operation.name(), key, params, definition.step_names());
        tracing::debug!(workflow = operation.name(), run_id = %run.id, "admitting run");
        Ok(self.store.admit(run).await?)
    }
}
