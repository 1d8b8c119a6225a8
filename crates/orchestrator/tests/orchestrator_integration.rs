//! Integration tests for the saga engine against a scripted executor.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::RunId;
use executor::{Executor, StepContext, StepError};
use ledger::{
    InMemoryStore, ProvisionStore, ResourceKind, ResourceLedgerEntry, ResourceStatus, RunStatus,
    StepStatus,
};
use orchestrator::{Orchestrator, ProvisionError};
use workflow::{AppKind, Operation, StepDef};

/// Scripted executor that records every call and can fail on demand.
#[derive(Clone, Default)]
struct FakeExecutor {
    log: Arc<Mutex<Vec<String>>>,
    fail_step: Arc<Mutex<Option<&'static str>>>,
    fail_compensation: Arc<Mutex<Option<&'static str>>>,
    cancel_after: Arc<Mutex<Option<(&'static str, InMemoryStore, RunId)>>>,
}

impl FakeExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn fail_step(&self, step: &'static str) {
        *self.fail_step.lock().unwrap() = Some(step);
    }

    fn fail_compensation(&self, step: &'static str) {
        *self.fail_compensation.lock().unwrap() = Some(step);
    }

    /// Requests cancellation of `run_id` while `step` is executing, so the
    /// flag is observed before the next step starts.
    fn cancel_after(&self, step: &'static str, store: InMemoryStore, run_id: RunId) {
        *self.cancel_after.lock().unwrap() = Some((step, store, run_id));
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn executed(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|e| e.starts_with("exec:"))
            .collect()
    }

    fn compensated(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|e| e.starts_with("comp:"))
            .collect()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(
        &self,
        step: &StepDef,
        _ctx: &StepContext<'_>,
    ) -> Result<serde_json::Value, StepError> {
        self.log.lock().unwrap().push(format!("exec:{}", step.name));

        if *self.fail_step.lock().unwrap() == Some(step.name) {
            return Err(StepError::Fatal("injected failure".to_string()));
        }

        let cancel = self.cancel_after.lock().unwrap().clone();
        if let Some((name, store, run_id)) = cancel
            && name == step.name
        {
            store.request_cancel(run_id).await.unwrap();
        }

        Ok(serde_json::json!({ "step": step.name }))
    }

    async fn compensate(&self, step: &StepDef, _ctx: &StepContext<'_>) -> Result<(), StepError> {
        self.log.lock().unwrap().push(format!("comp:{}", step.name));

        if *self.fail_compensation.lock().unwrap() == Some(step.name) {
            return Err(StepError::Fatal("injected compensation failure".to_string()));
        }
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator<InMemoryStore, FakeExecutor>>,
    store: InMemoryStore,
    executor: FakeExecutor,
}

fn setup() -> Harness {
    let store = InMemoryStore::new();
    let executor = FakeExecutor::new();
    Harness {
        orchestrator: Arc::new(Orchestrator::new(store.clone(), executor.clone())),
        store,
        executor,
    }
}

async fn seed_active_domain(store: &InMemoryStore, domain: &str) {
    store
        .record_resource(ResourceLedgerEntry::pending(
            ResourceKind::Domain,
            domain,
            RunId::new(),
        ))
        .await
        .unwrap();
    store
        .set_resource_status(ResourceKind::Domain, domain, ResourceStatus::Active)
        .await
        .unwrap();
}

fn install_params() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("domain".to_string(), "example.com".to_string()),
        ("db_name".to_string(), "wp_example".to_string()),
        ("db_user".to_string(), "wp_user".to_string()),
    ])
}

const INSTALL: Operation = Operation::InstallApp(AppKind::WordPress);

#[tokio::test]
async fn install_happy_path_runs_all_steps_in_order() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;

    let outcome = h
        .orchestrator
        .provision(&INSTALL, install_params())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(
        h.executor.executed(),
        vec![
            "exec:create-database",
            "exec:create-db-user",
            "exec:grant-privileges",
            "exec:download-release",
            "exec:extract-and-place-files",
            "exec:write-config-file",
            "exec:set-permissions",
            "exec:record-installation",
        ]
    );
    assert!(h.executor.compensated().is_empty());

    let database = h
        .store
        .lookup(ResourceKind::Database, "wp_example")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(database.status, ResourceStatus::Active);

    let install = h
        .store
        .lookup(ResourceKind::AppInstall, "example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(install.status, ResourceStatus::Active);
}

#[tokio::test]
async fn config_failure_compensates_in_strict_reverse_order() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;
    h.executor.fail_step("write-config-file");

    let outcome = h
        .orchestrator
        .provision(&INSTALL, install_params())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert_eq!(
        h.executor.compensated(),
        vec![
            "comp:extract-and-place-files",
            "comp:download-release",
            "comp:grant-privileges",
            "comp:create-db-user",
            "comp:create-database",
        ]
    );

    let run = h.store.get_run(outcome.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::RolledBack);
    assert_eq!(
        run.step("write-config-file").unwrap().status,
        StepStatus::Failed
    );
    for name in [
        "create-database",
        "create-db-user",
        "grant-privileges",
        "download-release",
        "extract-and-place-files",
    ] {
        assert_eq!(run.step(name).unwrap().status, StepStatus::Compensated);
    }

    // The database entry created by step 1 ends rolled back; the install
    // entry was never recorded.
    let entries = h
        .store
        .list_resources(Some(ResourceKind::Database))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, ResourceStatus::RolledBack);
    assert!(h
        .store
        .lookup(ResourceKind::AppInstall, "example.com")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn compensation_failure_leaves_a_failed_run_for_the_operator() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;
    h.executor.fail_step("write-config-file");
    h.executor.fail_compensation("create-database");

    let result = h.orchestrator.provision(&INSTALL, install_params()).await;
    let Err(ProvisionError::CompensationFailed { step, .. }) = result else {
        panic!("expected CompensationFailed, got {result:?}");
    };
    assert_eq!(step, "create-database");

    let runs = h.store.list_runs().await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0]
        .error
        .as_deref()
        .unwrap()
        .contains("compensation for step 'create-database' failed"));

    // The partially-rolled-back database entry stays live, marked failed.
    let database = h
        .store
        .lookup(ResourceKind::Database, "wp_example")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(database.status, ResourceStatus::Failed);
}

#[tokio::test]
async fn failed_resource_blocks_reprovisioning_until_cleared() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;
    h.executor.fail_step("write-config-file");
    h.executor.fail_compensation("create-database");
    let _ = h.orchestrator.provision(&INSTALL, install_params()).await;

    // The failed run released the operation key, but the database entry is
    // still live, so a retry rolls back at create-database.
    *h.executor.fail_step.lock().unwrap() = None;
    *h.executor.fail_compensation.lock().unwrap() = None;

    let outcome = h
        .orchestrator
        .provision(&INSTALL, install_params())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::RolledBack);

    let run = h.store.get_run(outcome.run_id).await.unwrap().unwrap();
    assert!(run.error.as_deref().unwrap().contains("already exists"));
}

#[tokio::test]
async fn restart_resumes_from_the_first_unfinished_step() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;

    let admission = h
        .orchestrator
        .admit(&INSTALL, install_params())
        .await
        .unwrap();
    let run_id = admission.run_id();

    // Simulate a crash after the first three steps completed.
    let mut run = h.store.get_run(run_id).await.unwrap().unwrap();
    for name in ["create-database", "create-db-user", "grant-privileges"] {
        run.step_done(name, serde_json::json!({ "step": name }));
    }
    h.store.save_run(&run).await.unwrap();

    let resumed = h.orchestrator.resume(run_id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Succeeded);

    // Steps 1-3 were not re-executed.
    assert_eq!(
        h.executor.executed(),
        vec![
            "exec:download-release",
            "exec:extract-and-place-files",
            "exec:write-config-file",
            "exec:set-permissions",
            "exec:record-installation",
        ]
    );
}

#[tokio::test]
async fn terminal_runs_cannot_be_resumed() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;

    let outcome = h
        .orchestrator
        .provision(&INSTALL, install_params())
        .await
        .unwrap();
    let result = h.orchestrator.resume(outcome.run_id).await;
    assert!(matches!(
        result,
        Err(ProvisionError::NotResumable { status: RunStatus::Succeeded, .. })
    ));
}

#[tokio::test]
async fn stalled_run_sweep_drives_idle_runs_to_completion() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;

    let admission = h
        .orchestrator
        .admit(&INSTALL, install_params())
        .await
        .unwrap();
    let run_id = admission.run_id();

    // Make the run look idle.
    let mut run = h.store.get_run(run_id).await.unwrap().unwrap();
    run.updated_at = chrono::Utc::now() - chrono::Duration::seconds(600);
    h.store.save_run(&run).await.unwrap();

    let recovered = h
        .orchestrator
        .recover_stalled(std::time::Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(recovered, vec![run_id]);

    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn cancellation_is_honoured_between_steps() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;

    let admission = h
        .orchestrator
        .admit(&INSTALL, install_params())
        .await
        .unwrap();
    let run_id = admission.run_id();
    h.executor
        .cancel_after("create-db-user", h.store.clone(), run_id);

    let run = h.orchestrator.drive(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::RolledBack);
    assert_eq!(run.error.as_deref(), Some("run cancelled"));

    // The interrupted step finished, then everything done was compensated.
    assert_eq!(
        h.executor.executed(),
        vec!["exec:create-database", "exec:create-db-user"]
    );
    assert_eq!(
        h.executor.compensated(),
        vec!["comp:create-db-user", "comp:create-database"]
    );
}

#[tokio::test]
async fn concurrent_admission_yields_exactly_one_new_run() {
    let h = setup();
    seed_active_domain(&h.store, "example.com").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.admit(&INSTALL, install_params()).await.unwrap()
        }));
    }

    let mut new_count = 0;
    for handle in handles {
        if handle.await.unwrap().is_new() {
            new_count += 1;
        }
    }
    assert_eq!(new_count, 1);
}
