//! Execution tracking types: registered workflows, runs, and step executions.
//!
//! These are the records persisted by the repository for run history and
//! cross-run queries. The run directory on disk remains authoritative for
//! artefacts; these rows mirror `Run`/`StepExecution` state for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
}

impl RunStatus {
    /// Whether the run has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Error)
    }
}

/// Status of an individual step execution.
///
/// Terminal states are `Completed`, `Failed`, `Error`,
/// `TerminatedTimeLimit`, and `Skipped`. A step execution transitions at
/// most once out of each terminal state; re-running a step on resume
/// creates a fresh `StepExecution` row instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
    TerminatedTimeLimit,
    Skipped,
}

impl StepStatus {
    /// Whether the step has reached a final state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the step counts as satisfied for its dependants.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::TerminatedTimeLimit => "TERMINATED_TIME_LIMIT",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Registered workflow
// ---------------------------------------------------------------------------

/// A workflow definition as registered in the store, keyed by
/// `(name, version)`. Registering the same pair again returns the existing
/// row unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Surrogate ID assigned on first registration.
    pub id: Uuid,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The full definition as JSON, for display and API retrieval.
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run record
// ---------------------------------------------------------------------------

/// A single execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Opaque run identifier of the form `YYYYMMDD_HHMMSS_<8-hex>`.
    pub run_id: String,
    /// ID of the registered workflow being executed.
    pub workflow_id: Uuid,
    /// Workflow name (denormalized for display).
    pub workflow_name: String,
    /// Workflow version (denormalized for display).
    pub workflow_version: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Resolved input bindings for this run.
    pub inputs: serde_json::Value,
    /// Absolute path of the run directory.
    pub run_dir: String,
    /// Error message if the run failed before or during scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Step execution record
// ---------------------------------------------------------------------------

/// Execution log for a single step within a run.
///
/// `(run_id, step_name, attempt)` is unique; resume creates a new row with
/// a higher attempt rather than mutating the finished one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 row ID.
    pub id: Uuid,
    /// Parent run ID.
    pub run_id: String,
    /// Step name matching the workflow definition.
    pub step_name: String,
    pub status: StepStatus,
    /// Attempt number (1-based, increments on resume).
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Container exit code, when the process ran to an exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Human-readable error text for failed/errored steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Path of the step's log file under `logs/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    /// Files discovered under `outputs/` that appeared during this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
