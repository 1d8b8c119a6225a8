//! Provisioning endpoints: start operations, poll runs, audit the ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::RunId;
use executor::Executor;
use ledger::{Admission, ProvisionStore, ResourceKind, ResourceLedgerEntry, WorkflowRun};
use orchestrator::Orchestrator;
use serde::{Deserialize, Serialize};
use workflow::Operation;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S: ProvisionStore + Clone, E: Executor> {
    pub orchestrator: Orchestrator<S, E>,
    pub store: S,
}

// -- Response types --

#[derive(Serialize)]
pub struct StartResponse {
    pub run_id: String,
    pub status: String,
    pub deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct RunResponse {
    pub run_id: String,
    pub workflow: String,
    pub status: String,
    pub cancel_requested: bool,
    pub steps: Vec<StepResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub run_id: String,
    pub cancel_requested: bool,
}

#[derive(Serialize)]
pub struct ResourceResponse {
    pub kind: String,
    pub natural_key: String,
    pub status: String,
    pub run_id: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    pub kind: Option<String>,
}

fn run_response(run: WorkflowRun) -> RunResponse {
    RunResponse {
        run_id: run.id.to_string(),
        workflow: run.workflow,
        status: run.status.to_string(),
        cancel_requested: run.cancel_requested,
        steps: run
            .steps
            .into_iter()
            .map(|s| StepResponse {
                name: s.name,
                status: s.status.to_string(),
                error: s.error,
            })
            .collect(),
        error: run.error,
        result: run.result,
        created_at: run.created_at.to_rfc3339(),
        updated_at: run.updated_at.to_rfc3339(),
    }
}

fn resource_response(entry: ResourceLedgerEntry) -> ResourceResponse {
    ResourceResponse {
        kind: entry.kind.to_string(),
        natural_key: entry.natural_key,
        status: entry.status.to_string(),
        run_id: entry.run_id.to_string(),
        created_at: entry.created_at.to_rfc3339(),
    }
}

// -- Handlers --

/// POST /provision/:operation — start a provisioning operation.
///
/// Fast operations run inline and return their terminal status. Slow
/// operations (app installs, certificate issuance) are admitted, driven on
/// a background task, and return `202 Accepted` with a pollable run ID.
#[tracing::instrument(skip(state, params))]
pub async fn start<S, E>(
    State(state): State<Arc<AppState<S, E>>>,
    Path(operation): Path<String>,
    Json(params): Json<BTreeMap<String, String>>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError>
where
    S: ProvisionStore + Clone + 'static,
    E: Executor + 'static,
{
    let operation = Operation::parse(&operation)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown operation '{operation}'")))?;

    if operation.is_background() {
        let admission = state.orchestrator.admit(&operation, params).await?;
        let response = match admission {
            Admission::AdmittedNew(run_id) => {
                let task_state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = task_state.orchestrator.drive(run_id).await {
                        tracing::error!(%run_id, error = %e, "background run failed");
                    }
                });
                (
                    StatusCode::ACCEPTED,
                    StartResponse {
                        run_id: run_id.to_string(),
                        status: "running".to_string(),
                        deduplicated: false,
                        result: None,
                    },
                )
            }
            Admission::AlreadyInFlight(run_id) => (
                StatusCode::OK,
                StartResponse {
                    run_id: run_id.to_string(),
                    status: "running".to_string(),
                    deduplicated: true,
                    result: None,
                },
            ),
            Admission::AlreadyCompleted { run_id, result } => (
                StatusCode::OK,
                StartResponse {
                    run_id: run_id.to_string(),
                    status: "succeeded".to_string(),
                    deduplicated: true,
                    result,
                },
            ),
        };
        let (status, body) = response;
        return Ok((status, Json(body)));
    }

    let outcome = state.orchestrator.provision(&operation, params).await?;
    Ok((
        StatusCode::OK,
        Json(StartResponse {
            run_id: outcome.run_id.to_string(),
            status: outcome.status.to_string(),
            deduplicated: outcome.deduplicated,
            result: outcome.result,
        }),
    ))
}

/// GET /provision/runs/:id — current run and step snapshot.
#[tracing::instrument(skip(state))]
pub async fn get_run<S, E>(
    State(state): State<Arc<AppState<S, E>>>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError>
where
    S: ProvisionStore + Clone + 'static,
    E: Executor + 'static,
{
    let run_id = parse_run_id(&id)?;
    let run = state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {id} not found")))?;
    Ok(Json(run_response(run)))
}

/// GET /provision/runs — list runs, newest first.
#[tracing::instrument(skip(state))]
pub async fn list_runs<S, E>(
    State(state): State<Arc<AppState<S, E>>>,
) -> Result<Json<Vec<RunResponse>>, ApiError>
where
    S: ProvisionStore + Clone + 'static,
    E: Executor + 'static,
{
    let runs = state.store.list_runs().await?;
    Ok(Json(runs.into_iter().map(run_response).collect()))
}

/// POST /provision/runs/:id/cancel — request cancellation of a run.
#[tracing::instrument(skip(state))]
pub async fn cancel_run<S, E>(
    State(state): State<Arc<AppState<S, E>>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError>
where
    S: ProvisionStore + Clone + 'static,
    E: Executor + 'static,
{
    let run_id = parse_run_id(&id)?;
    let accepted = state.orchestrator.cancel(run_id).await?;
    Ok(Json(CancelResponse {
        run_id: run_id.to_string(),
        cancel_requested: accepted,
    }))
}

/// GET /provision/resources — audit view over the resource ledger.
#[tracing::instrument(skip(state))]
pub async fn list_resources<S, E>(
    State(state): State<Arc<AppState<S, E>>>,
    Query(query): Query<ResourceQuery>,
) -> Result<Json<Vec<ResourceResponse>>, ApiError>
where
    S: ProvisionStore + Clone + 'static,
    E: Executor + 'static,
{
    let kind = match query.kind.as_deref() {
        Some(raw) => Some(
            ResourceKind::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown resource kind '{raw}'")))?,
        ),
        None => None,
    };
    let entries = state.store.list_resources(kind).await?;
    Ok(Json(entries.into_iter().map(resource_response).collect()))
}

fn parse_run_id(id: &str) -> Result<RunId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid run ID format: {e}")))?;
    Ok(RunId::from(uuid))
}
