//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ledger::LedgerError;
use orchestrator::ProvisionError;

/// API-level error type that maps to HTTP responses.
///
/// Responses carry the error kind and a safe message only; raw command
/// output and stack traces never reach the caller.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Provisioning engine error.
    Provision(ProvisionError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Provision(err) => provision_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn provision_error_to_response(err: ProvisionError) -> (StatusCode, String) {
    match &err {
        ProvisionError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        ProvisionError::MissingDependency { .. } | ProvisionError::RunNotFound(_) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        ProvisionError::NotResumable { .. } => (StatusCode::CONFLICT, err.to_string()),
        ProvisionError::Ledger(LedgerError::DuplicateResource { .. }) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        ProvisionError::Ledger(LedgerError::RunNotFound(_)) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        ProvisionError::CompensationFailed { .. } => {
            tracing::error!(error = %err, "run requires operator attention");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        ApiError::Provision(err)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Provision(ProvisionError::Ledger(err))
    }
}
