//! Workflow run state machine and per-step records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{OperationKey, RunId};
use serde::{Deserialize, Serialize};

/// The overall state of a workflow run.
///
/// State transitions:
/// ```text
/// Running ──┬──► Succeeded
///           ├──► RolledBack   (all compensations completed)
///           └──► Failed       (a compensation itself failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Steps are being executed (or the run is awaiting resume).
    Running,

    /// All steps completed successfully (terminal state).
    Succeeded,

    /// Compensation finished after a step failure (terminal state).
    RolledBack,

    /// A compensation failed; the ledger may be partially rolled back
    /// and requires operator attention (terminal state).
    Failed,
}

impl RunStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::Failed => "failed",
        }
    }

    /// Parses a status from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "rolled_back" => Some(RunStatus::RolledBack),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not started yet.
    #[default]
    Pending,

    /// Step is currently executing.
    Running,

    /// Step completed; its compensation may run if the workflow fails later.
    Done,

    /// Step failed after retries were exhausted (or a fatal error).
    Failed,

    /// The step's compensating action has been applied.
    Compensated,
}

impl StepStatus {
    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted record of one step in a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name, matching the workflow definition.
    pub name: String,

    /// Current step status.
    pub status: StepStatus,

    /// Opaque result produced by the step; inputs for later steps.
    /// Never contains secret material, only opaque handles.
    pub output: Option<serde_json::Value>,

    /// Error detail if the step failed.
    pub error: Option<String>,
}

impl StepRecord {
    /// Creates a pending step record.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
        }
    }
}

/// A persisted provisioning workflow run.
///
/// Owned exclusively by the orchestrator; persisted before and after each
/// step transition so that a crash mid-run can be resumed from the last
/// completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run identifier.
    pub id: RunId,

    /// Workflow name, e.g. `install_wordpress`.
    pub workflow: String,

    /// Deduplication key this run was admitted under.
    pub operation_key: OperationKey,

    /// Request parameters the run was started with.
    pub params: BTreeMap<String, String>,

    /// Ordered step records, one per workflow definition step.
    pub steps: Vec<StepRecord>,

    /// Overall run status.
    pub status: RunStatus,

    /// Set when cancellation has been requested; checked between steps.
    pub cancel_requested: bool,

    /// Safe result summary, set when the run succeeds.
    pub result: Option<serde_json::Value>,

    /// Error detail for rolled-back or failed runs.
    pub error: Option<String>,

    /// When the run was created.
    pub created_at: DateTime<Utc>,

    /// When the run was last persisted.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Creates a new running workflow with pending step records.
    pub fn new(
        workflow: impl Into<String>,
        operation_key: OperationKey,
        params: BTreeMap<String, String>,
        step_names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            workflow: workflow.into(),
            operation_key,
            params,
            steps: step_names.into_iter().map(StepRecord::new).collect(),
            status: RunStatus::Running,
            cancel_requested: false,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the step record with the given name.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Marks a step as running.
    pub fn step_started(&mut self, name: &str) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Running;
        }
        self.touch();
    }

    /// Marks a step as done with its output.
    pub fn step_done(&mut self, name: &str, output: serde_json::Value) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Done;
            step.output = Some(output);
            step.error = None;
        }
        self.touch();
    }

    /// Marks a step as failed with an error detail.
    pub fn step_failed(&mut self, name: &str, error: impl Into<String>) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Failed;
            step.error = Some(error.into());
        }
        self.touch();
    }

    /// Marks a completed step as compensated.
    pub fn step_compensated(&mut self, name: &str) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Compensated;
        }
        self.touch();
    }

    /// Returns the names of steps that reached `done`, in execution order.
    pub fn done_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns the output of a completed step.
    pub fn step_output(&self, name: &str) -> Option<&serde_json::Value> {
        self.step(name).and_then(|s| s.output.as_ref())
    }

    /// Returns true when every step has reached `done`.
    pub fn all_steps_done(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Done)
    }

    /// Marks the run as succeeded with a result summary.
    pub fn mark_succeeded(&mut self, result: serde_json::Value) {
        self.status = RunStatus::Succeeded;
        self.result = Some(result);
        self.touch();
    }

    /// Marks the run as rolled back after successful compensation.
    pub fn mark_rolled_back(&mut self, error: impl Into<String>) {
        self.status = RunStatus::RolledBack;
        self.error = Some(error.into());
        self.touch();
    }

    /// Marks the run as failed; reachable only via a failed compensation.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
