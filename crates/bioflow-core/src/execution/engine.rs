//! Engine façade: the single entry point the CLI and HTTP API invoke.
//!
//! `WorkflowEngine` owns the lifetime of one scheduler per run. `run` takes
//! a validated definition through registration, run-directory creation,
//! input staging, scheduling, and final status bookkeeping; `resume`
//! re-executes the non-completed tail of an earlier run against the same
//! run directory; `cancel` trips the per-run cancellation token that every
//! runner observes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bioflow_types::error::RepositoryError;
use bioflow_types::run::{RunRecord, RunStatus, StepExecution, StepStatus, WorkflowRecord};
use bioflow_types::workflow::{Resources, WorkflowDefinition};
use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::RunRepository;
use crate::workflow::context::RunContext;
use crate::workflow::definition::{WorkflowError, load_workflow_file, validate_definition};

use super::checkpoint::CheckpointManager;
use super::container::ContainerDriver;
use super::run_dir::{RunDirError, RunDirectory, generate_run_id};
use super::scheduler::{DagScheduler, SchedulerError, StepSnapshot};
use super::step_runner::{StepRunner, TimeLimits};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory under which `runs/<name>/<version>/<run_id>/` trees live.
    pub base_dir: PathBuf,
    /// Budget for steps without their own `time_limit`.
    pub default_time_limit: Duration,
    /// Disable all step timers.
    pub disable_time_limits: bool,
    /// Window between container stop and kill.
    pub grace_period: Duration,
}

impl EngineConfig {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            default_time_limit: Duration::from_secs(3600),
            disable_time_limits: false,
            grace_period: Duration::from_secs(10),
        }
    }

    fn time_limits(&self) -> TimeLimits {
        TimeLimits {
            disabled: self.disable_time_limits,
            default: self.default_time_limit,
        }
    }
}

/// Per-invocation options for [`WorkflowEngine::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// CLI/API input overrides, merged over the declared inputs.
    pub inputs: HashMap<String, String>,
    /// Maximum steps in flight (minimum 1).
    pub parallel: usize,
    /// Pre-generated run ID (the HTTP layer allocates one so it can answer
    /// before the run finishes). Generated when absent.
    pub run_id: Option<String>,
}

/// Per-step overrides applied on resume. The stored definition itself is
/// never mutated.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct StepOverride {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub resources: Option<Resources>,
}

// ---------------------------------------------------------------------------
// Outcome and errors
// ---------------------------------------------------------------------------

/// Result of driving a run (fresh or resumed) to a terminal state.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub run_dir: PathBuf,
    /// True when the run ended because of an external cancel signal.
    pub cancelled: bool,
    pub steps: IndexMap<String, StepSnapshot>,
}

/// Errors surfaced by the engine façade.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Definition failed to load or validate; no run was created.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// Run directory creation or input staging failed.
    #[error(transparent)]
    RunDir(#[from] RunDirError),

    /// Scheduling aborted (persistence failed twice or a runner died).
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A repository query failed.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Run not found (for resume/cancel/status).
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The run is not in a state the operation accepts.
    #[error("run {run_id}: {reason}")]
    InvalidState { run_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrates loader, run directory, scheduler, and repository.
pub struct WorkflowEngine<D: ContainerDriver, R: RunRepository + Clone + 'static> {
    driver: Arc<D>,
    repo: R,
    checkpoint: Arc<CheckpointManager<R>>,
    config: EngineConfig,
    /// Cancellation tokens for in-flight runs, keyed by run ID.
    cancellations: DashMap<String, CancellationToken>,
}

impl<D: ContainerDriver, R: RunRepository + Clone + 'static> WorkflowEngine<D, R> {
    pub fn new(driver: Arc<D>, repo: R, config: EngineConfig) -> Self {
        let checkpoint = Arc::new(CheckpointManager::new(repo.clone()));
        Self {
            driver,
            repo,
            checkpoint,
            config,
            cancellations: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Execute a fresh run of `def` and drive it to a terminal state.
    pub async fn run(
        &self,
        def: &WorkflowDefinition,
        options: RunOptions,
    ) -> Result<RunOutcome, ExecutorError> {
        validate_definition(def)?;

        let workflow = self.register_workflow(def).await?;
        let run_id = options.run_id.clone().unwrap_or_else(generate_run_id);

        let layout =
            RunDirectory::create(&self.config.base_dir, &def.name, &def.version, &run_id)?;
        layout.save_workflow_copy(def)?;

        tracing::info!(
            run_id = run_id.as_str(),
            workflow = def.name.as_str(),
            version = def.version.as_str(),
            "starting run"
        );

        // Stage inputs before the first dispatch; a staging failure is
        // recorded as an ERROR run.
        let resolved_inputs = match layout.stage_inputs(&def.inputs, &options.inputs) {
            Ok(resolved) => resolved,
            Err(e) => {
                let record = self.run_record(&workflow, &run_id, &layout, json!({}));
                self.repo.create_run(&record).await?;
                self.repo
                    .update_run_status(
                        &run_id,
                        RunStatus::Error,
                        Some(Utc::now()),
                        Some(&e.to_string()),
                    )
                    .await?;
                tracing::error!(run_id = run_id.as_str(), error = %e, "input staging failed");
                return Err(e.into());
            }
        };

        let record = self.run_record(&workflow, &run_id, &layout, resolved_inputs.clone());
        self.repo.create_run(&record).await?;

        let mut ctx = RunContext::new(
            json!(def.config),
            resolved_inputs,
            &layout.run_dir.display().to_string(),
        );

        self.execute(
            def,
            &run_id,
            &mut ctx,
            &layout,
            &HashMap::new(),
            &HashMap::new(),
            options.parallel,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Re-execute the non-completed tail of an earlier run.
    ///
    /// Completed steps are treated as satisfied and their recorded outputs
    /// re-injected; every other step is rescheduled with a fresh attempt.
    /// Resuming an already-completed run is a no-op returning the stored
    /// terminal snapshot.
    pub async fn resume(
        &self,
        run_id: &str,
        overrides: &HashMap<String, StepOverride>,
        parallel: usize,
    ) -> Result<RunOutcome, ExecutorError> {
        let run = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        let history = self.repo.list_step_executions(run_id).await?;

        if run.status == RunStatus::Completed {
            tracing::info!(run_id, "run already completed, resume is a no-op");
            return Ok(RunOutcome {
                run_id: run_id.to_string(),
                status: run.status,
                run_dir: PathBuf::from(&run.run_dir),
                cancelled: false,
                steps: snapshot_from_history(&history),
            });
        }
        if run.status == RunStatus::Running {
            return Err(ExecutorError::InvalidState {
                run_id: run_id.to_string(),
                reason: "run is still RUNNING".to_string(),
            });
        }

        let layout = RunDirectory::open(PathBuf::from(&run.run_dir))?;
        let mut def = load_workflow_file(&layout.workflow_copy_path())?;
        apply_overrides(&mut def, overrides);
        validate_definition(&def)?;

        // Latest row per step decides what is already satisfied and which
        // attempt number the next execution gets.
        let mut satisfied: HashMap<String, Vec<String>> = HashMap::new();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        for name in def.steps.keys() {
            let last = history
                .iter()
                .filter(|s| &s.step_name == name)
                .max_by_key(|s| s.attempt);
            if let Some(last) = last {
                if last.status == StepStatus::Completed {
                    satisfied.insert(name.clone(), last.outputs.clone());
                } else {
                    attempts.insert(name.clone(), last.attempt + 1);
                }
            }
        }

        tracing::info!(
            run_id,
            satisfied = satisfied.len(),
            rescheduled = def.steps.len() - satisfied.len(),
            "resuming run"
        );

        self.repo
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await?;

        let mut ctx = RunContext::new(
            json!(def.config),
            run.inputs.clone(),
            &layout.run_dir.display().to_string(),
        );

        self.execute(&def, run_id, &mut ctx, &layout, &satisfied, &attempts, parallel)
            .await
    }

    // -----------------------------------------------------------------------
    // Cancel / status / list
    // -----------------------------------------------------------------------

    /// Trip the cancel signal for an in-flight run. Pending steps are
    /// skipped and running containers stopped; the call returns immediately
    /// while the run settles to its terminal state.
    pub fn cancel(&self, run_id: &str) -> Result<(), ExecutorError> {
        match self.cancellations.get(run_id) {
            Some(token) => {
                tracing::info!(run_id, "cancel requested");
                token.cancel();
                Ok(())
            }
            None => Err(ExecutorError::RunNotFound(run_id.to_string())),
        }
    }

    /// Cancel every in-flight run (Ctrl-C handling in the CLI).
    pub fn cancel_all(&self) {
        for entry in self.cancellations.iter() {
            tracing::info!(run_id = entry.key().as_str(), "cancel requested");
            entry.value().cancel();
        }
    }

    /// A run together with its step executions.
    pub async fn status(
        &self,
        run_id: &str,
    ) -> Result<(RunRecord, Vec<StepExecution>), ExecutorError> {
        let run = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        let steps = self.repo.list_step_executions(run_id).await?;
        Ok((run, steps))
    }

    /// Recent runs, optionally filtered by workflow name.
    pub async fn list(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, ExecutorError> {
        Ok(self.repo.list_runs(workflow_name, limit).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn register_workflow(
        &self,
        def: &WorkflowDefinition,
    ) -> Result<WorkflowRecord, ExecutorError> {
        let record = WorkflowRecord {
            id: Uuid::now_v7(),
            name: def.name.clone(),
            version: def.version.clone(),
            description: def.description.clone(),
            definition: serde_json::to_value(def)
                .map_err(|e| WorkflowError::ParseError(e.to_string()))?,
            created_at: Utc::now(),
        };
        Ok(self.repo.create_workflow(&record).await?)
    }

    fn run_record(
        &self,
        workflow: &WorkflowRecord,
        run_id: &str,
        layout: &RunDirectory,
        inputs: Value,
    ) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            workflow_version: workflow.version.clone(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            inputs,
            run_dir: layout.run_dir.display().to_string(),
            error: None,
        }
    }

    /// Schedule the steps and finalize the run record.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        def: &WorkflowDefinition,
        run_id: &str,
        ctx: &mut RunContext,
        layout: &RunDirectory,
        satisfied: &HashMap<String, Vec<String>>,
        attempts: &HashMap<String, u32>,
        parallel: usize,
    ) -> Result<RunOutcome, ExecutorError> {
        let cancel = CancellationToken::new();
        self.cancellations
            .insert(run_id.to_string(), cancel.clone());

        let runner = Arc::new(StepRunner::new(
            Arc::clone(&self.driver),
            self.config.time_limits(),
            self.config.grace_period,
        ));
        let scheduler = DagScheduler::new(runner, Arc::clone(&self.checkpoint), parallel);

        let result = scheduler
            .run(def, run_id, ctx, layout, satisfied, attempts, &cancel)
            .await;

        self.cancellations.remove(run_id);
        let cancelled = cancel.is_cancelled();

        let snapshots = match result {
            Ok(snapshots) => snapshots,
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .repo
                    .update_run_status(run_id, RunStatus::Error, Some(Utc::now()), Some(&message))
                    .await;
                tracing::error!(run_id, error = message.as_str(), "run aborted");
                return Err(e.into());
            }
        };

        let status = run_status_of(&snapshots);
        let error = if cancelled {
            Some("cancelled".to_string())
        } else {
            first_failure(&snapshots)
        };

        self.checkpoint
            .run_status(run_id, status, Some(Utc::now()), error.as_deref())
            .await
            .map_err(SchedulerError::from)?;

        if let Err(e) = layout.cleanup_tmp() {
            tracing::warn!(run_id, error = %e, "failed to clean tmp directory");
        }

        tracing::info!(run_id, status = %status, "run finished");

        Ok(RunOutcome {
            run_id: run_id.to_string(),
            status,
            run_dir: layout.run_dir.clone(),
            cancelled,
            steps: snapshots,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A run is COMPLETED iff every step is COMPLETED or SKIPPED.
fn run_status_of(snapshots: &IndexMap<String, StepSnapshot>) -> RunStatus {
    let all_ok = snapshots
        .values()
        .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped));
    if all_ok {
        RunStatus::Completed
    } else {
        RunStatus::Failed
    }
}

/// Human-readable summary of the first non-successful step.
fn first_failure(snapshots: &IndexMap<String, StepSnapshot>) -> Option<String> {
    snapshots.iter().find_map(|(name, s)| {
        matches!(
            s.status,
            StepStatus::Failed | StepStatus::Error | StepStatus::TerminatedTimeLimit
        )
        .then(|| format!("step '{name}' finished as {}", s.status))
    })
}

/// Rebuild the terminal snapshot of a run from its persisted step rows,
/// keeping the latest attempt per step.
fn snapshot_from_history(history: &[StepExecution]) -> IndexMap<String, StepSnapshot> {
    let mut snapshots: IndexMap<String, StepSnapshot> = IndexMap::new();
    for row in history {
        let replace = snapshots
            .get(&row.step_name)
            .is_none_or(|existing| row.attempt >= existing.attempt);
        if replace {
            snapshots.insert(
                row.step_name.clone(),
                StepSnapshot {
                    status: row.status,
                    attempt: row.attempt,
                    exit_code: row.exit_code,
                    error: row.error.clone(),
                    outputs: row.outputs.clone(),
                },
            );
        }
    }
    snapshots
}

/// Apply resume-time step overrides to a cloned definition.
fn apply_overrides(
    def: &mut WorkflowDefinition,
    overrides: &HashMap<String, StepOverride>,
) {
    for (name, over) in overrides {
        if let Some(step) = def.steps.get_mut(name) {
            if let Some(command) = &over.command {
                step.command = command.clone();
            }
            if let Some(resources) = &over.resources {
                step.resources = resources.clone();
            }
        } else {
            tracing::warn!(step = name.as_str(), "override targets unknown step, ignoring");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
