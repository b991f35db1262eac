//! Bounded-parallel DAG scheduler.
//!
//! One scheduler drives one run. It owns the per-step status map on a
//! single control path, so state-machine updates are sequenced and
//! race-free: each tick drains the ready queue (declaration order) while
//! fewer than P runners are in flight, then suspends until a runner
//! completes. A step whose dependency reaches a terminal state other than
//! `COMPLETED` is skipped, and the skip fans out to its transitive
//! dependants. Cancellation skips the pending tail and drains in-flight
//! runners, which observe the same token and stop their containers.

use std::collections::HashMap;
use std::sync::Arc;

use bioflow_types::run::{StepExecution, StepStatus};
use bioflow_types::workflow::WorkflowDefinition;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::repository::RunRepository;
use crate::workflow::context::RunContext;
use crate::workflow::dag;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::container::ContainerDriver;
use super::run_dir::RunDirectory;
use super::step_runner::{StepOutcome, StepRunner};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that abort a scheduled run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Persistence failed twice; the run is recorded as `ERROR`.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// A runner task panicked or was torn down.
    #[error("runner task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Final state of one step as observed by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct StepSnapshot {
    pub status: StepStatus,
    pub attempt: u32,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub outputs: Vec<String>,
}

impl StepSnapshot {
    fn pending(attempt: u32) -> Self {
        Self {
            status: StepStatus::Pending,
            attempt,
            exit_code: None,
            error: None,
            outputs: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// DagScheduler
// ---------------------------------------------------------------------------

/// Schedules the steps of one workflow run over a bounded runner pool.
pub struct DagScheduler<D: ContainerDriver, R: RunRepository> {
    runner: Arc<StepRunner<D>>,
    checkpoint: Arc<CheckpointManager<R>>,
    max_parallel: usize,
}

impl<D: ContainerDriver, R: RunRepository + 'static> DagScheduler<D, R> {
    /// `max_parallel` is clamped to at least 1.
    pub fn new(
        runner: Arc<StepRunner<D>>,
        checkpoint: Arc<CheckpointManager<R>>,
        max_parallel: usize,
    ) -> Self {
        Self {
            runner,
            checkpoint,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Drive every step of `def` to a terminal state.
    ///
    /// `satisfied` carries steps already `COMPLETED` in a previous attempt
    /// (resume), mapped to their recorded outputs; `attempts` carries the
    /// attempt number to use per step (defaults to 1). Returns the final
    /// snapshot per step in declaration order.
    pub async fn run(
        &self,
        def: &WorkflowDefinition,
        run_id: &str,
        ctx: &mut RunContext,
        layout: &RunDirectory,
        satisfied: &HashMap<String, Vec<String>>,
        attempts: &HashMap<String, u32>,
        cancel: &CancellationToken,
    ) -> Result<IndexMap<String, StepSnapshot>, SchedulerError> {
        let dependents = dag::dependents_of(def);

        let mut snapshots: IndexMap<String, StepSnapshot> = def
            .steps
            .keys()
            .map(|name| {
                let attempt = attempts.get(name).copied().unwrap_or(1);
                (name.clone(), StepSnapshot::pending(attempt))
            })
            .collect();

        // Seed prior completions so their dependants are admissible and
        // their outputs resolve in command templates.
        for (name, outputs) in satisfied {
            if let Some(snapshot) = snapshots.get_mut(name) {
                snapshot.status = StepStatus::Completed;
                snapshot.outputs = outputs.clone();
                ctx.set_step_outputs(name, outputs);
            }
        }

        let mut join_set: JoinSet<Result<(String, StepOutcome, StepExecution), CheckpointError>> =
            JoinSet::new();
        let mut cancel_handled = false;

        loop {
            if cancel.is_cancelled() && !cancel_handled {
                cancel_handled = true;
                self.skip_pending(run_id, "run cancelled", &mut snapshots)
                    .await?;
            }

            if !cancel_handled {
                let ready = ready_steps(def, &snapshots);
                for name in ready {
                    if join_set.len() >= self.max_parallel {
                        break;
                    }
                    self.dispatch(&mut join_set, def, run_id, &name, ctx, layout, &snapshots, cancel);
                    snapshots.get_mut(&name).unwrap().status = StepStatus::Running;
                }
            }

            if join_set.is_empty() {
                break;
            }

            let joined = join_set
                .join_next()
                .await
                .expect("join_set checked non-empty");

            let (name, outcome, exec) = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(checkpoint_err)) => {
                    self.abort(cancel, &mut join_set).await;
                    return Err(checkpoint_err.into());
                }
                Err(join_err) => {
                    self.abort(cancel, &mut join_set).await;
                    return Err(SchedulerError::Join(join_err.to_string()));
                }
            };

            let snapshot = snapshots.get_mut(&name).unwrap();
            snapshot.status = outcome.status;
            snapshot.exit_code = outcome.exit_code;
            snapshot.error = outcome.error.clone();
            snapshot.outputs = outcome.outputs.clone();
            snapshot.attempt = exec.attempt;

            if outcome.status.is_success() {
                ctx.set_step_outputs(&name, &outcome.outputs);
            } else {
                // Terminal non-COMPLETED: fan the skip out to every
                // transitive dependant still pending.
                let doomed = dag::transitive_dependents(&name, &dependents);
                for dependent in def.steps.keys() {
                    if !doomed.contains(dependent) {
                        continue;
                    }
                    if snapshots[dependent].status != StepStatus::Pending {
                        continue;
                    }
                    let reason = format!("dependency '{name}' finished as {}", outcome.status);
                    let attempt = snapshots[dependent].attempt;
                    self.checkpoint
                        .step_skipped(run_id, dependent, attempt, &reason)
                        .await?;
                    let snap = snapshots.get_mut(dependent).unwrap();
                    snap.status = StepStatus::Skipped;
                    snap.error = Some(reason);
                    tracing::info!(run_id, step = dependent.as_str(), cause = name.as_str(), "step skipped");
                }
            }
        }

        Ok(snapshots)
    }

    /// Spawn one runner task for `name`.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        join_set: &mut JoinSet<Result<(String, StepOutcome, StepExecution), CheckpointError>>,
        def: &WorkflowDefinition,
        run_id: &str,
        name: &str,
        ctx: &RunContext,
        layout: &RunDirectory,
        snapshots: &IndexMap<String, StepSnapshot>,
        cancel: &CancellationToken,
    ) {
        let runner = Arc::clone(&self.runner);
        let checkpoint = Arc::clone(&self.checkpoint);
        let step = def.steps[name].clone();
        let step_name = name.to_string();
        let run_id = run_id.to_string();
        let ctx = ctx.clone();
        let layout = layout.clone();
        let cancel = cancel.clone();
        let attempt = snapshots[name].attempt;

        tracing::debug!(run_id = run_id.as_str(), step = step_name.as_str(), attempt, "dispatching step");

        join_set.spawn(async move {
            let log_file = layout.log_file(&step_name).display().to_string();
            let mut exec = checkpoint
                .step_started(&run_id, &step_name, attempt, &log_file)
                .await?;

            let outcome = runner
                .run(&run_id, &step_name, attempt, &step, ctx, &layout, &cancel)
                .await;

            exec.status = outcome.status;
            exec.end_time = Some(Utc::now());
            exec.exit_code = outcome.exit_code;
            exec.error = outcome.error.clone();
            exec.outputs = outcome.outputs.clone();
            checkpoint.step_finished(&exec).await?;

            Ok((step_name, outcome, exec))
        });
    }

    /// Mark every still-pending step as skipped.
    async fn skip_pending(
        &self,
        run_id: &str,
        reason: &str,
        snapshots: &mut IndexMap<String, StepSnapshot>,
    ) -> Result<(), SchedulerError> {
        let pending: Vec<String> = snapshots
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Pending)
            .map(|(name, _)| name.clone())
            .collect();

        for name in pending {
            let attempt = snapshots[&name].attempt;
            self.checkpoint
                .step_skipped(run_id, &name, attempt, reason)
                .await?;
            let snap = snapshots.get_mut(&name).unwrap();
            snap.status = StepStatus::Skipped;
            snap.error = Some(reason.to_string());
        }
        Ok(())
    }

    /// Stop in-flight runners and drain their tasks after a fatal error.
    async fn abort(
        &self,
        cancel: &CancellationToken,
        join_set: &mut JoinSet<Result<(String, StepOutcome, StepExecution), CheckpointError>>,
    ) {
        cancel.cancel();
        while join_set.join_next().await.is_some() {}
    }
}

/// Pending steps whose dependencies are all `COMPLETED`, in declaration
/// order. Dispatch order among simultaneously-ready steps follows the
/// workflow document.
fn ready_steps(
    def: &WorkflowDefinition,
    snapshots: &IndexMap<String, StepSnapshot>,
) -> Vec<String> {
    snapshots
        .iter()
        .filter(|(name, snapshot)| {
            snapshot.status == StepStatus::Pending
                && def.steps[name.as_str()]
                    .after
                    .iter()
                    .all(|dep| snapshots[dep].status.is_success())
        })
        .map(|(name, _)| name.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::step_runner::TimeLimits;
    use crate::execution::testing::{InMemoryRepository, ScriptedDriver};
    use bioflow_types::workflow::{Resources, StepDefinition};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn step(command: &str, after: Vec<&str>) -> StepDefinition {
        StepDefinition {
            container: "ubuntu:22.04".to_string(),
            command: command.to_string(),
            resources: Resources::default(),
            after: after.into_iter().map(String::from).collect(),
        }
    }

    fn workflow(steps: Vec<(&str, &str, Vec<&str>)>) -> WorkflowDefinition {
        let mut map = indexmap::IndexMap::new();
        for (name, command, after) in steps {
            map.insert(name.to_string(), step(command, after));
        }
        WorkflowDefinition {
            name: "test-wf".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            config: Default::default(),
            inputs: Default::default(),
            steps: map,
        }
    }

    struct Fixture {
        _base: tempfile::TempDir,
        layout: RunDirectory,
        driver: Arc<ScriptedDriver>,
        repo: Arc<InMemoryRepository>,
        checkpoint: Arc<CheckpointManager<Arc<InMemoryRepository>>>,
    }

    fn fixture(driver: ScriptedDriver) -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let layout = RunDirectory::create(base.path(), "test-wf", "1.0.0", "run1").unwrap();
        let driver = Arc::new(driver);
        let repo = Arc::new(InMemoryRepository::new());
        let checkpoint = Arc::new(CheckpointManager::new(Arc::clone(&repo)));
        Fixture {
            _base: base,
            layout,
            driver,
            repo,
            checkpoint,
        }
    }

    fn scheduler(
        fx: &Fixture,
        max_parallel: usize,
    ) -> DagScheduler<ScriptedDriver, Arc<InMemoryRepository>> {
        let runner = Arc::new(StepRunner::new(
            Arc::clone(&fx.driver),
            TimeLimits::default(),
            Duration::from_millis(10),
        ));
        DagScheduler::new(runner, Arc::clone(&fx.checkpoint), max_parallel)
    }

    fn context(layout: &RunDirectory) -> RunContext {
        RunContext::new(json!({}), json!({}), &layout.run_dir.display().to_string())
    }

    async fn run_all(
        sched: &DagScheduler<ScriptedDriver, Arc<InMemoryRepository>>,
        def: &WorkflowDefinition,
        fx: &Fixture,
    ) -> IndexMap<String, StepSnapshot> {
        let mut ctx = context(&fx.layout);
        sched
            .run(
                def,
                "run1",
                &mut ctx,
                &fx.layout,
                &HashMap::new(),
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Linear success (scenario: a -> b)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_chain_completes_in_order() {
        let def = workflow(vec![("a", "echo a", vec![]), ("b", "echo b", vec!["a"])]);
        let fx = fixture(ScriptedDriver::new());
        let sched = scheduler(&fx, 4);

        let snapshots = run_all(&sched, &def, &fx).await;

        assert_eq!(snapshots["a"].status, StepStatus::Completed);
        assert_eq!(snapshots["b"].status, StepStatus::Completed);

        // b must not start before a ended.
        let a_rows = fx.repo.step_rows("run1", "a");
        let b_rows = fx.repo.step_rows("run1", "b");
        let a_end = a_rows.last().unwrap().end_time.unwrap();
        let b_start = b_rows.first().unwrap().start_time.unwrap();
        assert!(b_start >= a_end, "b started before its dependency finished");
    }

    // -----------------------------------------------------------------------
    // Fan-out / fan-in (scenario: generate -> {x3} -> final, P=4)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_fan_out_runs_middle_steps_concurrently() {
        let def = workflow(vec![
            ("generate", "gen", vec![]),
            ("count_words", "count", vec!["generate"]),
            ("calc_sum", "sum", vec!["generate"]),
            ("sort_fruits", "sort", vec!["generate"]),
            ("final", "merge", vec!["count_words", "calc_sum", "sort_fruits"]),
        ]);
        let driver = ScriptedDriver::new();
        for cmd in ["count", "sum", "sort"] {
            driver.script(cmd, Duration::from_millis(50), 0);
        }
        let fx = fixture(driver);
        let sched = scheduler(&fx, 4);

        let snapshots = run_all(&sched, &def, &fx).await;

        assert!(snapshots.values().all(|s| s.status == StepStatus::Completed));
        // The three middle steps overlapped.
        assert!(
            fx.driver.max_concurrent.load(Ordering::SeqCst) >= 3,
            "middle steps should run concurrently under P=4"
        );
        // final dispatched last.
        let started = fx.driver.started.lock().unwrap();
        assert_eq!(started.first().map(String::as_str), Some("gen"));
        assert_eq!(started.last().map(String::as_str), Some("merge"));
    }

    #[tokio::test]
    async fn test_parallelism_bound_is_respected() {
        let def = workflow(vec![
            ("a", "w1", vec![]),
            ("b", "w2", vec![]),
            ("c", "w3", vec![]),
            ("d", "w4", vec![]),
        ]);
        let driver = ScriptedDriver::new();
        for cmd in ["w1", "w2", "w3", "w4"] {
            driver.script(cmd, Duration::from_millis(30), 0);
        }
        let fx = fixture(driver);
        let sched = scheduler(&fx, 2);

        run_all(&sched, &def, &fx).await;

        assert!(
            fx.driver.max_concurrent.load(Ordering::SeqCst) <= 2,
            "never more than P steps in flight"
        );
    }

    #[tokio::test]
    async fn test_ready_ties_dispatch_in_declaration_order() {
        let def = workflow(vec![
            ("zeta", "z", vec![]),
            ("alpha", "a", vec![]),
            ("mid", "m", vec![]),
        ]);
        let fx = fixture(ScriptedDriver::new());
        let sched = scheduler(&fx, 1);

        run_all(&sched, &def, &fx).await;

        let started = fx.driver.started.lock().unwrap();
        assert_eq!(started.as_slice(), ["z", "a", "m"]);
    }

    // -----------------------------------------------------------------------
    // Failure propagation (scenario: a(exit 1) -> b -> c)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_failure_skips_transitive_dependants() {
        let def = workflow(vec![
            ("a", "boom", vec![]),
            ("b", "after-a", vec!["a"]),
            ("c", "after-b", vec!["b"]),
            ("island", "independent", vec![]),
        ]);
        let driver = ScriptedDriver::new();
        driver.script("boom", Duration::from_millis(5), 1);
        let fx = fixture(driver);
        let sched = scheduler(&fx, 2);

        let snapshots = run_all(&sched, &def, &fx).await;

        assert_eq!(snapshots["a"].status, StepStatus::Failed);
        assert_eq!(snapshots["b"].status, StepStatus::Skipped);
        assert_eq!(snapshots["c"].status, StepStatus::Skipped);
        // An unrelated branch still runs to completion.
        assert_eq!(snapshots["island"].status, StepStatus::Completed);

        // Skips are persisted with the failing dependency named.
        let b_rows = fx.repo.step_rows("run1", "b");
        assert_eq!(b_rows.len(), 1);
        assert_eq!(b_rows[0].status, StepStatus::Skipped);
        assert!(b_rows[0].error.as_deref().unwrap().contains("'a'"));
    }

    #[tokio::test]
    async fn test_skipped_dependency_also_skips_dependants() {
        // a fails; b depends on a; c depends on b only. c must be skipped
        // through b without b ever running.
        let def = workflow(vec![
            ("a", "boom", vec![]),
            ("b", "x", vec!["a"]),
            ("c", "y", vec!["b"]),
        ]);
        let driver = ScriptedDriver::new();
        driver.script("boom", Duration::from_millis(5), 1);
        let fx = fixture(driver);
        let sched = scheduler(&fx, 4);

        let snapshots = run_all(&sched, &def, &fx).await;

        assert_eq!(snapshots["c"].status, StepStatus::Skipped);
        let started = fx.driver.started.lock().unwrap();
        assert_eq!(started.as_slice(), ["boom"], "only the failing step ran");
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_pre_cancelled_run_skips_everything() {
        let def = workflow(vec![("a", "x", vec![]), ("b", "y", vec!["a"])]);
        let fx = fixture(ScriptedDriver::new());
        let sched = scheduler(&fx, 2);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut ctx = context(&fx.layout);
        let snapshots = sched
            .run(
                &def,
                "run1",
                &mut ctx,
                &fx.layout,
                &HashMap::new(),
                &HashMap::new(),
                &cancel,
            )
            .await
            .unwrap();

        assert!(snapshots.values().all(|s| s.status == StepStatus::Skipped));
        assert!(fx.driver.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_skips_pending_tail() {
        let def = workflow(vec![
            ("slow", "slow-cmd", vec![]),
            ("tail", "tail-cmd", vec!["slow"]),
        ]);
        let driver = ScriptedDriver::new();
        driver.script("slow-cmd", Duration::from_millis(200), 0);
        let fx = fixture(driver);
        let sched = scheduler(&fx, 1);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let mut ctx = context(&fx.layout);
        let snapshots = sched
            .run(
                &def,
                "run1",
                &mut ctx,
                &fx.layout,
                &HashMap::new(),
                &HashMap::new(),
                &cancel,
            )
            .await
            .unwrap();

        // The in-flight step was stopped (FAILED via cancel), the tail never ran.
        assert_eq!(snapshots["slow"].status, StepStatus::Failed);
        assert_eq!(snapshots["tail"].status, StepStatus::Skipped);
        let started = fx.driver.started.lock().unwrap();
        assert_eq!(started.as_slice(), ["slow-cmd"]);
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_resume_skips_satisfied_steps() {
        let def = workflow(vec![
            ("a", "first", vec![]),
            ("b", "second", vec!["a"]),
        ]);
        let fx = fixture(ScriptedDriver::new());
        let sched = scheduler(&fx, 2);

        let satisfied =
            HashMap::from([("a".to_string(), vec!["/runs/outputs/a.txt".to_string()])]);
        let attempts = HashMap::from([("b".to_string(), 2u32)]);

        let mut ctx = context(&fx.layout);
        let snapshots = sched
            .run(
                &def,
                "run1",
                &mut ctx,
                &fx.layout,
                &satisfied,
                &attempts,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(snapshots["a"].status, StepStatus::Completed);
        assert_eq!(snapshots["b"].status, StepStatus::Completed);
        assert_eq!(snapshots["b"].attempt, 2);

        // Only b actually ran.
        let started = fx.driver.started.lock().unwrap();
        assert_eq!(started.as_slice(), ["second"]);

        // The prior outputs were re-injected for substitution.
        assert!(ctx.lookup("steps.a.outputs.files").is_some());
    }

    #[tokio::test]
    async fn test_resume_records_new_rows_with_higher_attempt() {
        let def = workflow(vec![("a", "retry-me", vec![])]);
        let fx = fixture(ScriptedDriver::new());
        let sched = scheduler(&fx, 1);

        let attempts = HashMap::from([("a".to_string(), 3u32)]);
        let mut ctx = context(&fx.layout);
        sched
            .run(
                &def,
                "run1",
                &mut ctx,
                &fx.layout,
                &HashMap::new(),
                &attempts,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let rows = fx.repo.step_rows("run1", "a");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attempt, 3);
    }

    // -----------------------------------------------------------------------
    // Persistence of transitions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_each_step_gets_running_then_terminal_row() {
        let def = workflow(vec![("a", "ok", vec![])]);
        let fx = fixture(ScriptedDriver::new());
        let sched = scheduler(&fx, 1);

        run_all(&sched, &def, &fx).await;

        let rows = fx.repo.step_rows("run1", "a");
        // One row, upserted from RUNNING to COMPLETED.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, StepStatus::Completed);
        assert!(rows[0].start_time.is_some());
        assert!(rows[0].end_time.is_some());
        assert_eq!(rows[0].exit_code, Some(0));
        assert!(rows[0].log_file.as_deref().unwrap().ends_with("logs/a.log"));
    }
}
