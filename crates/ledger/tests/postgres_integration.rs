//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p ledger --test postgres_integration -- --test-threads=1
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{OperationKey, RunId};
use ledger::{
    Admission, LedgerError, PostgresStore, ProvisionStore, ResourceKind, ResourceLedgerEntry,
    ResourceStatus, RunStatus, WorkflowRun,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Create a temporary pool just for migrations
            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!("../../../migrations/0001_init.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE resource_ledger, workflow_runs")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

fn make_run(key: &OperationKey) -> WorkflowRun {
    WorkflowRun::new(
        "create_domain",
        key.clone(),
        BTreeMap::from([("domain".to_string(), "example.com".to_string())]),
        ["create-docroot", "record-domain"],
    )
}

#[tokio::test]
async fn admit_and_reload_run() {
    let store = get_test_store().await;
    let key = OperationKey::derive("create:domain", "example.com");
    let run = make_run(&key);
    let run_id = run.id;

    let admission = store.admit(run).await.unwrap();
    assert!(admission.is_new());

    let loaded = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(loaded.id, run_id);
    assert_eq!(loaded.status, RunStatus::Running);
    assert_eq!(loaded.workflow, "create_domain");
    assert_eq!(loaded.params["domain"], "example.com");
    assert_eq!(loaded.steps.len(), 2);
}

#[tokio::test]
async fn second_admission_sees_in_flight_run() {
    let store = get_test_store().await;
    let key = OperationKey::derive("create:domain", "inflight.example.com");
    let first = make_run(&key);
    let first_id = first.id;
    store.admit(first).await.unwrap();

    let admission = store.admit(make_run(&key)).await.unwrap();
    assert!(matches!(admission, Admission::AlreadyInFlight(id) if id == first_id));
}

#[tokio::test]
async fn admission_after_success_returns_cached_result() {
    let store = get_test_store().await;
    let key = OperationKey::derive("create:domain", "done.example.com");
    let mut run = make_run(&key);
    store.admit(run.clone()).await.unwrap();

    run.step_done("create-docroot", serde_json::json!({}));
    run.step_done("record-domain", serde_json::json!({}));
    run.mark_succeeded(serde_json::json!({"domain": "done.example.com"}));
    store.save_run(&run).await.unwrap();

    let admission = store.admit(make_run(&key)).await.unwrap();
    match admission {
        Admission::AlreadyCompleted { run_id, result } => {
            assert_eq!(run_id, run.id);
            assert_eq!(result.unwrap()["domain"], "done.example.com");
        }
        other => panic!("expected AlreadyCompleted, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_admission_yields_exactly_one_new() {
    let store = get_test_store().await;
    let key = OperationKey::derive("install:wordpress", "race.example.com");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let run = make_run(&key);
        handles.push(tokio::spawn(async move { store.admit(run).await.unwrap() }));
    }

    let mut new_count = 0;
    for handle in handles {
        if handle.await.unwrap().is_new() {
            new_count += 1;
        }
    }
    assert_eq!(new_count, 1);
}

#[tokio::test]
async fn rolled_back_run_releases_the_key() {
    let store = get_test_store().await;
    let key = OperationKey::derive("create:domain", "retry.example.com");
    let mut run = make_run(&key);
    store.admit(run.clone()).await.unwrap();

    run.mark_rolled_back("step 'create-docroot' failed");
    store.save_run(&run).await.unwrap();

    let admission = store.admit(make_run(&key)).await.unwrap();
    assert!(admission.is_new());
}

#[tokio::test]
async fn duplicate_live_resource_is_rejected() {
    let store = get_test_store().await;
    let key = OperationKey::derive("create:domain", "dup.example.com");
    let run = make_run(&key);
    let run_id = run.id;
    store.admit(run).await.unwrap();

    store
        .record_resource(ResourceLedgerEntry::pending(
            ResourceKind::Domain,
            "dup.example.com",
            run_id,
        ))
        .await
        .unwrap();

    let result = store
        .record_resource(ResourceLedgerEntry::pending(
            ResourceKind::Domain,
            "dup.example.com",
            run_id,
        ))
        .await;
    assert!(matches!(result, Err(LedgerError::DuplicateResource { .. })));
}

#[tokio::test]
async fn resource_status_lifecycle() {
    let store = get_test_store().await;
    let key = OperationKey::derive("create:database", "wp_example");
    let run = make_run(&key);
    let run_id = run.id;
    store.admit(run).await.unwrap();

    store
        .record_resource(ResourceLedgerEntry::pending(
            ResourceKind::Database,
            "wp_example",
            run_id,
        ))
        .await
        .unwrap();
    store
        .set_resource_status(ResourceKind::Database, "wp_example", ResourceStatus::Active)
        .await
        .unwrap();

    let entry = store
        .lookup(ResourceKind::Database, "wp_example")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, ResourceStatus::Active);

    store
        .set_resource_status(
            ResourceKind::Database,
            "wp_example",
            ResourceStatus::RolledBack,
        )
        .await
        .unwrap();
    assert!(store
        .lookup(ResourceKind::Database, "wp_example")
        .await
        .unwrap()
        .is_none());

    // The key is reusable once the old entry is rolled back.
    store
        .record_resource(ResourceLedgerEntry::pending(
            ResourceKind::Database,
            "wp_example",
            run_id,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_flag_persists() {
    let store = get_test_store().await;
    let key = OperationKey::derive("create:domain", "cancel.example.com");
    let run = make_run(&key);
    let run_id = run.id;
    store.admit(run).await.unwrap();

    assert!(store.request_cancel(run_id).await.unwrap());
    let loaded = store.get_run(run_id).await.unwrap().unwrap();
    assert!(loaded.cancel_requested);

    let missing = store.request_cancel(RunId::new()).await;
    assert!(matches!(missing, Err(LedgerError::RunNotFound(_))));
}

#[tokio::test]
async fn stalled_runs_only_returns_idle_running_runs() {
    let store = get_test_store().await;
    let key = OperationKey::derive("create:domain", "stalled.example.com");
    let mut run = make_run(&key);
    run.updated_at = chrono::Utc::now() - chrono::Duration::seconds(300);
    store.save_run(&run).await.unwrap();

    let stalled = store
        .stalled_runs(std::time::Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, run.id);

    let stalled = store
        .stalled_runs(std::time::Duration::from_secs(600))
        .await
        .unwrap();
    assert!(stalled.is_empty());
}

#[tokio::test]
async fn resources_for_run_lists_in_insertion_order() {
    let store = get_test_store().await;
    let key = OperationKey::derive("install:wordpress", "order.example.com");
    let run = make_run(&key);
    let run_id = run.id;
    store.admit(run).await.unwrap();

    store
        .record_resource(ResourceLedgerEntry::pending(
            ResourceKind::Database,
            "wp_order",
            run_id,
        ))
        .await
        .unwrap();
    store
        .record_resource(ResourceLedgerEntry::pending(
            ResourceKind::AppInstall,
            "order.example.com",
            run_id,
        ))
        .await
        .unwrap();

    let entries = store.resources_for_run(run_id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, ResourceKind::Database);
    assert_eq!(entries[1].kind, ResourceKind::AppInstall);
}
