//! API server entry point.

use std::sync::Arc;
use std::time::Duration;

use api::config::Config;
use api::routes::provision::AppState;
use executor::{
    ExecutorConfig, InMemorySecretStore, MySqlDatabaseAdmin, StepExecutor, SystemCommandRunner,
    SystemFileSystem,
};
use ledger::{InMemoryStore, PostgresStore, ProvisionStore};
use orchestrator::Orchestrator;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Interval of the stalled-run recovery sweep.
const RECOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Runs `running` but idle this long are considered stalled and resumed.
const STALL_THRESHOLD: Duration = Duration::from_secs(120);

/// Step executor over the real host capabilities.
type SystemExecutor =
    StepExecutor<SystemCommandRunner, SystemFileSystem, MySqlDatabaseAdmin, InMemorySecretStore>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn build_executor(config: &Config) -> SystemExecutor {
    let db = MySqlDatabaseAdmin::connect_lazy(&config.mysql_url)
        .expect("invalid MYSQL_URL");
    StepExecutor::new(
        SystemCommandRunner::new(),
        SystemFileSystem::new(),
        db,
        InMemorySecretStore::new(),
        ExecutorConfig::from_env(),
    )
}

async fn serve<S>(store: S, executor: SystemExecutor, config: Config)
where
    S: ProvisionStore + Clone + 'static,
{
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let state = Arc::new(AppState {
        orchestrator: Orchestrator::new(store.clone(), executor),
        store,
    });

    // Resume anything left running by a previous process, then keep a
    // periodic sweep going for runs that stall mid-flight.
    match state.orchestrator.recover_stalled(Duration::ZERO).await {
        Ok(recovered) if !recovered.is_empty() => {
            tracing::info!(count = recovered.len(), "recovered interrupted runs");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "startup recovery sweep failed"),
    }
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RECOVERY_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = sweep_state.orchestrator.recover_stalled(STALL_THRESHOLD).await {
                tracing::error!(error = %e, "recovery sweep failed");
            }
        }
    });

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let executor = build_executor(&config);

    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await
                .expect("failed to connect to DATABASE_URL");
            let store = PostgresStore::new(pool);
            store.run_migrations().await.expect("migrations failed");
            serve(store, executor, config).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            serve(InMemoryStore::new(), executor, config).await;
        }
    }
}
