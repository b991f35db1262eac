//! Per-step execution: substitution, container launch, time-budget
//! enforcement, and output discovery.
//!
//! A `StepRunner` executes exactly one step execution. It substitutes the
//! command template against the run context, ensures the image is present,
//! starts the container with the run directory mounted at its own path, and
//! races process exit against the step's deadline and the run's
//! cancellation token. On deadline expiry the container is stopped, then
//! killed after the grace window, and the step is recorded
//! `TERMINATED_TIME_LIMIT` regardless of how the process eventually exited.

use std::sync::Arc;
use std::time::Duration;

use bioflow_types::run::StepStatus;
use bioflow_types::workflow::StepDefinition;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::workflow::context::RunContext;
use crate::workflow::duration::parse_duration;

use super::container::{ContainerDriver, ContainerError, ContainerHandle, ContainerSpec};
use super::run_dir::RunDirectory;

// ---------------------------------------------------------------------------
// Time limits
// ---------------------------------------------------------------------------

/// Engine-wide time-limit policy.
#[derive(Debug, Clone, Copy)]
pub struct TimeLimits {
    /// When true no step gets a timer, regardless of per-step limits.
    pub disabled: bool,
    /// Budget for steps that do not declare their own `time_limit`.
    pub default: Duration,
}

impl TimeLimits {
    /// Resolve the budget for one step. `None` means "no timer".
    pub fn budget_for(&self, step: &StepDefinition) -> Option<Duration> {
        if self.disabled {
            return None;
        }
        match &step.resources.time_limit {
            // Limits are validated at load time; a parse failure here would
            // mean the definition bypassed validation.
            Some(limit) => parse_duration(limit).ok().map(Duration::from_secs),
            None => Some(self.default),
        }
    }
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self {
            disabled: false,
            default: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of running one step to a terminal state.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    /// Files that appeared under `outputs/` while the step ran.
    pub outputs: Vec<String>,
}

impl StepOutcome {
    fn error(message: String) -> Self {
        Self {
            status: StepStatus::Error,
            exit_code: None,
            error: Some(message),
            outputs: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes single steps through a container driver.
pub struct StepRunner<D: ContainerDriver> {
    driver: Arc<D>,
    time_limits: TimeLimits,
    grace_period: Duration,
}

impl<D: ContainerDriver> StepRunner<D> {
    pub fn new(driver: Arc<D>, time_limits: TimeLimits, grace_period: Duration) -> Self {
        Self {
            driver,
            time_limits,
            grace_period,
        }
    }

    /// Run one step to a terminal state.
    ///
    /// `ctx` must already carry the run's config, inputs, and completed-step
    /// outputs; the runner injects the step's own resources before
    /// substitution. Launch failures (image pull, daemon unreachable) come
    /// back as `ERROR`; a lost race against the deadline as
    /// `TERMINATED_TIME_LIMIT`; cancellation as `FAILED`.
    pub async fn run(
        &self,
        run_id: &str,
        step_name: &str,
        attempt: u32,
        step: &StepDefinition,
        mut ctx: RunContext,
        layout: &RunDirectory,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        ctx.set_resources(json!({
            "cpu": step.resources.cpu,
            "memory": step.resources.memory,
            "time_limit": step.resources.time_limit,
        }));
        let command = ctx.resolve(&step.command);

        tracing::info!(run_id, step = step_name, command = command.as_str(), "starting step");

        let before = layout.output_snapshot();

        if let Err(e) = self.driver.ensure_image(&step.container).await {
            tracing::error!(run_id, step = step_name, error = %e, "image not available");
            return StepOutcome::error(e.to_string());
        }

        let spec = ContainerSpec {
            image: step.container.clone(),
            command,
            cpu: step.resources.cpu,
            memory: step.resources.memory.clone(),
            mount_dir: layout.run_dir.clone(),
            log_file: layout.log_file(step_name),
            container_name: container_name(run_id, step_name, attempt),
        };

        let mut handle = match self.driver.start(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(run_id, step = step_name, error = %e, "container launch failed");
                return StepOutcome::error(e.to_string());
            }
        };

        let budget = self.time_limits.budget_for(step);
        let mut outcome = self
            .await_exit(run_id, step_name, &mut handle, budget, cancel)
            .await;

        // Best-effort discovery of files the step produced.
        let after = layout.output_snapshot();
        let mut produced: Vec<String> = after
            .difference(&before)
            .map(|p| p.display().to_string())
            .collect();
        produced.sort();
        outcome.outputs = produced;

        tracing::info!(
            run_id,
            step = step_name,
            status = %outcome.status,
            exit_code = ?outcome.exit_code,
            "step finished"
        );
        outcome
    }

    /// Race container exit against the deadline and cancellation.
    ///
    /// The select only decides *why* the wait ended; `handle` is free again
    /// once the racing futures are dropped, so stop/kill happens after.
    async fn await_exit(
        &self,
        run_id: &str,
        step_name: &str,
        handle: &mut D::Handle,
        budget: Option<Duration>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        enum ExitReason {
            Exited(Result<i64, ContainerError>),
            Deadline,
            Cancelled,
        }

        let reason = tokio::select! {
            result = handle.wait() => ExitReason::Exited(result),
            _ = sleep_or_forever(budget) => ExitReason::Deadline,
            _ = cancel.cancelled() => ExitReason::Cancelled,
        };

        match reason {
            ExitReason::Exited(Ok(0)) => StepOutcome {
                status: StepStatus::Completed,
                exit_code: Some(0),
                error: None,
                outputs: Vec::new(),
            },
            ExitReason::Exited(Ok(code)) => StepOutcome {
                status: StepStatus::Failed,
                exit_code: Some(code),
                error: Some(format!("command exited with code {code}")),
                outputs: Vec::new(),
            },
            ExitReason::Exited(Err(e)) => StepOutcome::error(e.to_string()),
            ExitReason::Cancelled => {
                tracing::info!(run_id, step = step_name, "cancellation requested, stopping container");
                self.stop_then_kill(handle).await;
                StepOutcome {
                    status: StepStatus::Failed,
                    exit_code: None,
                    error: Some("cancelled".to_string()),
                    outputs: Vec::new(),
                }
            }
            ExitReason::Deadline => {
                let limit = budget.expect("deadline cannot fire without a budget");
                tracing::warn!(
                    run_id,
                    step = step_name,
                    limit_secs = limit.as_secs(),
                    "time limit exceeded, stopping container"
                );
                self.stop_then_kill(handle).await;
                StepOutcome {
                    status: StepStatus::TerminatedTimeLimit,
                    exit_code: None,
                    error: Some(format!(
                        "terminated after exceeding time limit of {}s",
                        limit.as_secs()
                    )),
                    outputs: Vec::new(),
                }
            }
        }
    }

    /// Soft stop with the grace window, then hard kill.
    async fn stop_then_kill(&self, handle: &mut D::Handle) {
        if let Err(e) = handle.stop(self.grace_period).await {
            tracing::warn!(error = %e, "container stop failed, escalating to kill");
        }
        if let Err(e) = handle.kill().await {
            tracing::warn!(error = %e, "container kill failed");
        }
    }
}

/// Docker-safe container name for one step attempt.
fn container_name(run_id: &str, step_name: &str, attempt: u32) -> String {
    let safe_step: String = step_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("bioflow-{run_id}-{safe_step}-{attempt}")
}

/// Sleep for `budget`, or pend forever when no budget is set.
async fn sleep_or_forever(budget: Option<Duration>) {
    match budget {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
