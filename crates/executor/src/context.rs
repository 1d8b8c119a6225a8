//! Read-only view of a run's parameters and prior step outputs.

use std::collections::BTreeMap;

use crate::capabilities::secrets::SecretHandle;
use crate::error::StepError;

/// The context handed to each step execution.
///
/// Owned by the orchestrator for the run's lifetime; steps only read it.
/// Outputs are keyed by the producing step's name.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    params: &'a BTreeMap<String, String>,
    outputs: &'a BTreeMap<String, serde_json::Value>,
}

impl<'a> StepContext<'a> {
    /// Creates a context over run parameters and completed step outputs.
    pub fn new(
        params: &'a BTreeMap<String, String>,
        outputs: &'a BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self { params, outputs }
    }

    /// Returns a required run parameter.
    pub fn param(&self, name: &str) -> Result<&'a str, StepError> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StepError::Fatal(format!("missing run parameter '{name}'")))
    }

    /// Returns the output of a completed step, if any.
    pub fn output(&self, step: &str) -> Option<&'a serde_json::Value> {
        self.outputs.get(step)
    }

    /// Returns a string field from a completed step's output.
    pub fn output_str(&self, step: &str, field: &str) -> Result<&'a str, StepError> {
        self.output(step)
            .and_then(|v| v.get(field))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                StepError::Fatal(format!("missing output '{field}' from step '{step}'"))
            })
    }

    /// Returns a secret handle from a completed step's output.
    pub fn secret_handle(&self, step: &str, field: &str) -> Result<SecretHandle, StepError> {
        let value = self
            .output(step)
            .and_then(|v| v.get(field))
            .cloned()
            .ok_or_else(|| {
                StepError::Fatal(format!("missing output '{field}' from step '{step}'"))
            })?;
        serde_json::from_value(value).map_err(|_| {
            StepError::Fatal(format!("output '{field}' from step '{step}' is not a secret handle"))
        })
    }
}
