use thiserror::Error;

use crate::capabilities::CapabilityError;

/// Errors a step execution can produce.
///
/// The classification drives retry and compensation: `Transient` failures
/// on a retryable step are retried with backoff; everything else triggers
/// compensation. Messages never embed raw process output; commands are
/// reported by program name and exit status only.
#[derive(Debug, Error)]
pub enum StepError {
    /// Transient infrastructure failure (timeout, lock contention).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Non-retryable failure.
    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl StepError {
    /// Returns true if the error may be retried on a retryable step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

impl From<CapabilityError> for StepError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::Timeout { .. }
            | CapabilityError::Database(_)
            | CapabilityError::Io(_) => StepError::Transient(err.to_string()),
            CapabilityError::UnknownSecret => StepError::Fatal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StepError::Transient("timeout".into()).is_retryable());
        assert!(!StepError::Fatal("bad input".into()).is_retryable());
    }

    #[test]
    fn capability_classification() {
        let err: StepError = CapabilityError::Timeout {
            program: "wget".into(),
            timeout_secs: 60,
        }
        .into();
        assert!(err.is_retryable());

        let err: StepError = CapabilityError::UnknownSecret.into();
        assert!(!err.is_retryable());
    }
}
