//! The run driver: forward execution, compensation, recovery.

use std::collections::BTreeMap;
use std::time::Duration;

use common::RunId;
use executor::{Executor, StepContext, StepError};
use ledger::{
    Admission, LedgerError, ProvisionStore, ResourceLedgerEntry, ResourceStatus, RunStatus,
    StepStatus, WorkflowRun,
};
use workflow::{AppKind, Operation, ResourceSpec, WorkflowDefinition, definition_by_name};

use crate::error::{ProvisionError, Result};
use crate::guard::IdempotencyGuard;

/// Outcome of a provisioning request.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    /// The run the request resolved to.
    pub run_id: RunId,
    /// Status of that run when the request returned.
    pub status: RunStatus,
    /// True when the request was deduplicated onto an existing run.
    pub deduplicated: bool,
    /// Result summary of a succeeded run.
    pub result: Option<serde_json::Value>,
}

/// Orchestrates provisioning workflow runs.
///
/// Owns all writes to the ledger: step executors report what they did and
/// the orchestrator records it, so the declared state can never diverge
/// from what a step actually provisioned.
pub struct Orchestrator<S, E> {
    store: S,
    executor: E,
    guard: IdempotencyGuard<S>,
}

impl<S, E> Orchestrator<S, E>
where
    S: ProvisionStore + Clone,
    E: Executor,
{
    /// Creates a new orchestrator.
    pub fn new(store: S, executor: E) -> Self {
        let guard = IdempotencyGuard::new(store.clone());
        Self {
            store,
            executor,
            guard,
        }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validates and admits a request without driving it.
    ///
    /// Used by the API for slow operations, which are driven on a spawned
    /// task and polled via the run endpoints.
    pub async fn admit(
        &self,
        operation: &Operation,
        params: BTreeMap<String, String>,
    ) -> Result<Admission> {
        self.guard.admit(operation, params).await
    }

    /// Admits a request and drives it to a terminal state.
    #[tracing::instrument(skip(self, params), fields(operation = operation.name()))]
    pub async fn provision(
        &self,
        operation: &Operation,
        params: BTreeMap<String, String>,
    ) -> Result<ProvisionOutcome> {
        match self.admit(operation, params).await? {
            Admission::AdmittedNew(run_id) => {
                let run = self.drive(run_id).await?;
                Ok(ProvisionOutcome {
                    run_id,
                    status: run.status,
                    deduplicated: false,
                    result: run.result,
                })
            }
            Admission::AlreadyInFlight(run_id) => Ok(ProvisionOutcome {
                run_id,
                status: RunStatus::Running,
                deduplicated: true,
                result: None,
            }),
            Admission::AlreadyCompleted { run_id, result } => Ok(ProvisionOutcome {
                run_id,
                status: RunStatus::Succeeded,
                deduplicated: true,
                result,
            }),
        }
    }

    /// Drives a run to a terminal state.
    ///
    /// Steps that already reached `done` are skipped, so this is also the
    /// resume path after a crash: forward idempotency of the step executor
    /// guarantees no completed side effect is duplicated.
    #[tracing::instrument(skip(self))]
    pub async fn drive(&self, run_id: RunId) -> Result<WorkflowRun> {
        let run_start = std::time::Instant::now();
        metrics::counter!("provision_runs_total").increment(1);

        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(ProvisionError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let definition = definition_by_name(&run.workflow)
            .ok_or_else(|| ProvisionError::UnknownWorkflow(run.workflow.clone()))?;

        let mut idx = 0;
        while idx < definition.steps.len() {
            if run.steps[idx].status == StepStatus::Done {
                idx += 1;
                continue;
            }

            // Cancellation is observed between steps only; a step that has
            // started runs to completion or to its own timeout.
            if let Some(latest) = self.store.get_run(run.id).await?
                && latest.cancel_requested
            {
                run.cancel_requested = true;
                return self.roll_back(run, &definition, "run cancelled").await;
            }

            // Consecutive steps sharing a parallel group run concurrently.
            let group = definition.steps[idx].parallel_group;
            let mut batch = vec![idx];
            if group.is_some() {
                let mut next = idx + 1;
                while next < definition.steps.len()
                    && definition.steps[next].parallel_group == group
                    && run.steps[next].status != StepStatus::Done
                {
                    batch.push(next);
                    next += 1;
                }
            }

            for &i in &batch {
                run.step_started(definition.steps[i].name);
            }
            self.store.save_run(&run).await?;

            for &i in &batch {
                if let Some(spec) = &definition.steps[i].records
                    && let Err(e) = self.record_pending(&run, spec).await
                {
                    let step_name = definition.steps[i].name;
                    if matches!(e, LedgerError::DuplicateResource { .. }) {
                        run.step_failed(step_name, e.to_string());
                        self.store.save_run(&run).await?;
                        return self
                            .roll_back(run, &definition, &format!("step '{step_name}' failed: {e}"))
                            .await;
                    }
                    return Err(e.into());
                }
            }

            tracing::info!(workflow = %run.workflow, steps = ?batch_names(&definition, &batch), "step batch started");
            let params = run.params.clone();
            let outputs = outputs_of(&run);
            let results: Vec<(usize, std::result::Result<serde_json::Value, StepError>)> =
                if batch.len() == 1 {
                    let i = batch[0];
                    let ctx = StepContext::new(&params, &outputs);
                    vec![(i, self.executor.execute(&definition.steps[i], &ctx).await)]
                } else {
                    futures_util::future::join_all(batch.iter().map(|&i| {
                        let ctx = StepContext::new(&params, &outputs);
                        let step = &definition.steps[i];
                        async move { (i, self.executor.execute(step, &ctx).await) }
                    }))
                    .await
                };

            let mut failure: Option<(usize, StepError)> = None;
            for (i, result) in results {
                let step = &definition.steps[i];
                match result {
                    Ok(output) => {
                        run.step_done(step.name, output);
                        if let Some(spec) = &step.records {
                            self.set_resource(&run, spec, ResourceStatus::Active).await?;
                        }
                    }
                    Err(e) => {
                        run.step_failed(step.name, e.to_string());
                        // Nothing reached the host for this step's resource.
                        if let Some(spec) = &step.records {
                            self.set_resource(&run, spec, ResourceStatus::RolledBack)
                                .await?;
                        }
                        if failure.is_none() {
                            failure = Some((i, e));
                        }
                    }
                }
            }
            self.store.save_run(&run).await?;

            if let Some((i, e)) = failure {
                let step_name = definition.steps[i].name;
                tracing::warn!(workflow = %run.workflow, step = step_name, error = %e, "step failed");
                return self
                    .roll_back(run, &definition, &format!("step '{step_name}' failed: {e}"))
                    .await;
            }

            idx = batch.last().copied().unwrap_or(idx) + 1;
        }

        let result = result_summary(&run);
        run.mark_succeeded(result);
        self.store.save_run(&run).await?;

        let duration = run_start.elapsed().as_secs_f64();
        metrics::histogram!("provision_run_duration_seconds").record(duration);
        metrics::counter!("provision_runs_succeeded").increment(1);
        tracing::info!(run_id = %run.id, workflow = %run.workflow, duration, "run succeeded");

        Ok(run)
    }

    /// Resumes a non-terminal run, e.g. after a crash.
    pub async fn resume(&self, run_id: RunId) -> Result<WorkflowRun> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(ProvisionError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(ProvisionError::NotResumable {
                run_id,
                status: run.status,
            });
        }
        self.drive(run_id).await
    }

    /// Resumes every `running` run idle for at least `idle_for`.
    ///
    /// Returns the IDs of runs that reached a terminal state.
    pub async fn recover_stalled(&self, idle_for: Duration) -> Result<Vec<RunId>> {
        let stalled = self.store.stalled_runs(idle_for).await?;
        let mut recovered = Vec::new();
        for run in stalled {
            tracing::info!(run_id = %run.id, workflow = %run.workflow, "resuming stalled run");
            match self.drive(run.id).await {
                Ok(_) => recovered.push(run.id),
                Err(e) => {
                    tracing::error!(run_id = %run.id, error = %e, "stalled run recovery failed");
                }
            }
        }
        Ok(recovered)
    }

    /// Requests cancellation of a run; honoured before its next step.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool> {
        Ok(self.store.request_cancel(run_id).await?)
    }

    /// Runs compensations for completed steps in reverse order.
    async fn roll_back(
        &self,
        mut run: WorkflowRun,
        definition: &WorkflowDefinition,
        reason: &str,
    ) -> Result<WorkflowRun> {
        tracing::warn!(run_id = %run.id, workflow = %run.workflow, reason, "rolling back run");

        let done: Vec<usize> = (0..definition.steps.len())
            .filter(|&i| run.steps[i].status == StepStatus::Done)
            .collect();

        let params = run.params.clone();
        for &i in done.iter().rev() {
            let step = &definition.steps[i];
            let outputs = outputs_of(&run);
            let ctx = StepContext::new(&params, &outputs);

            match self.executor.compensate(step, &ctx).await {
                Ok(()) => {
                    run.step_compensated(step.name);
                    if let Some(spec) = &step.records {
                        self.set_resource(&run, spec, ResourceStatus::RolledBack)
                            .await?;
                    }
                    self.store.save_run(&run).await?;
                }
                Err(e) => {
                    // A failed compensation is never swallowed: the run is
                    // failed and the entry stays live for the operator.
                    if let Some(spec) = &step.records {
                        self.set_resource(&run, spec, ResourceStatus::Failed).await?;
                    }
                    run.mark_failed(format!("compensation for step '{}' failed: {e}", step.name));
                    self.store.save_run(&run).await?;
                    metrics::counter!("provision_runs_failed").increment(1);
                    tracing::error!(run_id = %run.id, step = step.name, error = %e, "compensation failed");
                    return Err(ProvisionError::CompensationFailed {
                        step: step.name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        run.mark_rolled_back(reason);
        self.store.save_run(&run).await?;
        metrics::counter!("provision_runs_rolled_back").increment(1);
        tracing::warn!(run_id = %run.id, workflow = %run.workflow, "run rolled back");

        Ok(run)
    }

    async fn record_pending(
        &self,
        run: &WorkflowRun,
        spec: &ResourceSpec,
    ) -> std::result::Result<(), LedgerError> {
        let natural_key = run
            .params
            .get(spec.key_param)
            .cloned()
            .unwrap_or_default();
        self.store
            .record_resource(ResourceLedgerEntry::pending(spec.kind, natural_key, run.id))
            .await
    }

    async fn set_resource(
        &self,
        run: &WorkflowRun,
        spec: &ResourceSpec,
        status: ResourceStatus,
    ) -> Result<()> {
        let natural_key = run
            .params
            .get(spec.key_param)
            .map(String::as_str)
            .unwrap_or_default();
        self.store
            .set_resource_status(spec.kind, natural_key, status)
            .await?;
        Ok(())
    }
}

fn outputs_of(run: &WorkflowRun) -> BTreeMap<String, serde_json::Value> {
    run.steps
        .iter()
        .filter_map(|s| s.output.as_ref().map(|o| (s.name.clone(), o.clone())))
        .collect()
}

fn batch_names<'a>(definition: &'a WorkflowDefinition, batch: &[usize]) -> Vec<&'a str> {
    batch.iter().map(|&i| definition.steps[i].name).collect()
}

fn result_summary(run: &WorkflowRun) -> serde_json::Value {
    let mut summary = serde_json::json!({
        "operation": run.workflow,
        "operation_key": run.operation_key.as_str(),
    });
    if let (Some(app), Some(domain)) = (run.params.get("app"), run.params.get("domain"))
        && let Some(app) = AppKind::parse(app)
    {
        summary["setup_url"] =
            serde_json::Value::String(format!("http://{domain}/{}", app.setup_path()));
    }
    summary
}
