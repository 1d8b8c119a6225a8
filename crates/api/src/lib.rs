//! HTTP API server with observability for the provisioning system.
//!
//! Provides REST endpoints for starting provisioning operations, polling
//! run state, cancelling runs, and auditing the resource ledger, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use executor::{
    Executor, ExecutorConfig, InMemoryCommandRunner, InMemoryDatabaseAdmin, InMemoryFileSystem,
    InMemorySecretStore, StepExecutor,
};
use ledger::{InMemoryStore, ProvisionStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::provision::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, E>(state: Arc<AppState<S, E>>, metrics_handle: PrometheusHandle) -> Router
where
    S: ProvisionStore + Clone + 'static,
    E: Executor + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/provision/runs", get(routes::provision::list_runs::<S, E>))
        .route("/provision/runs/{id}", get(routes::provision::get_run::<S, E>))
        .route(
            "/provision/runs/{id}/cancel",
            post(routes::provision::cancel_run::<S, E>),
        )
        .route(
            "/provision/resources",
            get(routes::provision::list_resources::<S, E>),
        )
        .route("/provision/{operation}", post(routes::provision::start::<S, E>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Step executor over in-memory capabilities, used for tests and for
/// running the server without a real host to provision.
pub type InMemoryExecutor = StepExecutor<
    InMemoryCommandRunner,
    InMemoryFileSystem,
    InMemoryDatabaseAdmin,
    InMemorySecretStore,
>;

/// Creates application state over an in-memory store and capabilities.
pub fn create_default_state(store: InMemoryStore) -> Arc<AppState<InMemoryStore, InMemoryExecutor>> {
    use orchestrator::Orchestrator;

    let executor = StepExecutor::new(
        InMemoryCommandRunner::new(),
        InMemoryFileSystem::new(),
        InMemoryDatabaseAdmin::new(),
        InMemorySecretStore::new(),
        ExecutorConfig::default(),
    );

    Arc::new(AppState {
        orchestrator: Orchestrator::new(store.clone(), executor),
        store,
    })
}
