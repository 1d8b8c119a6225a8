use thiserror::Error;

/// Validation errors for provisioning requests.
///
/// These fail fast, before any workflow run is created, so no
/// compensation is ever needed for them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The requested operation is not in the catalog.
    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),

    /// A required request parameter is missing.
    #[error("Missing required parameter '{0}'")]
    MissingParam(&'static str),

    /// The domain name is not syntactically valid.
    #[error("Invalid domain name '{0}'")]
    InvalidDomain(String),

    /// The database identifier contains disallowed characters.
    #[error("Invalid database identifier '{0}'")]
    InvalidIdentifier(String),

    /// The email address is not syntactically valid.
    #[error("Invalid email address '{0}'")]
    InvalidEmail(String),
}
