//! Shared test doubles for the execution layer: a scripted container driver
//! and an in-memory repository.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bioflow_types::error::RepositoryError;
use bioflow_types::run::{RunRecord, RunStatus, StepExecution, WorkflowRecord};
use chrono::{DateTime, Utc};

use crate::repository::RunRepository;

use super::container::{ContainerDriver, ContainerError, ContainerHandle, ContainerSpec};

// ---------------------------------------------------------------------------
// Scripted driver
// ---------------------------------------------------------------------------

/// Per-command script for the [`ScriptedDriver`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Script {
    pub run_for: Duration,
    pub exit_code: i64,
}

/// Container driver whose "containers" sleep for a scripted duration and
/// exit with a scripted code, keyed by the substituted command string.
/// Unscripted commands complete quickly with exit 0.
#[derive(Default)]
pub(crate) struct ScriptedDriver {
    scripts: Mutex<HashMap<String, Script>>,
    /// Commands in dispatch order.
    pub started: Mutex<Vec<String>>,
    current: Arc<AtomicUsize>,
    /// High-water mark of simultaneously live containers.
    pub max_concurrent: Arc<AtomicUsize>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, command: &str, run_for: Duration, exit_code: i64) {
        self.scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), Script { run_for, exit_code });
    }
}

pub(crate) struct ScriptedHandle {
    script: Script,
    _gauge: GaugeGuard,
}

struct GaugeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ContainerDriver for ScriptedDriver {
    type Handle = ScriptedHandle;

    async fn ensure_image(&self, _image: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ScriptedHandle, ContainerError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&spec.command)
            .copied()
            .unwrap_or(Script {
                run_for: Duration::from_millis(5),
                exit_code: 0,
            });

        self.started.lock().unwrap().push(spec.command.clone());

        let live = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(live, Ordering::SeqCst);

        Ok(ScriptedHandle {
            script,
            _gauge: GaugeGuard {
                current: Arc::clone(&self.current),
            },
        })
    }
}

impl ContainerHandle for ScriptedHandle {
    async fn wait(&mut self) -> Result<i64, ContainerError> {
        tokio::time::sleep(self.script.run_for).await;
        Ok(self.script.exit_code)
    }

    async fn stop(&mut self, _grace: Duration) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), ContainerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory repository
// ---------------------------------------------------------------------------

/// Repository keeping everything in mutex-guarded vectors, mirroring the
/// upsert semantics of the SQLite implementation.
#[derive(Default)]
pub(crate) struct InMemoryRepository {
    pub workflows: Mutex<Vec<WorkflowRecord>>,
    pub runs: Mutex<Vec<RunRecord>>,
    pub steps: Mutex<Vec<StepExecution>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step rows for one step name, oldest first.
    pub fn step_rows(&self, run_id: &str, step_name: &str) -> Vec<StepExecution> {
        self.steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.run_id == run_id && s.step_name == step_name)
            .cloned()
            .collect()
    }
}

impl RunRepository for InMemoryRepository {
    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
    ) -> Result<WorkflowRecord, RepositoryError> {
        let mut workflows = self.workflows.lock().unwrap();
        if let Some(existing) = workflows
            .iter()
            .find(|w| w.name == record.name && w.version == record.version)
        {
            return Ok(existing.clone());
        }
        workflows.push(record.clone());
        Ok(record.clone())
    }

    async fn get_workflow_by_name_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowRecord>, RepositoryError> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.name == name && w.version == version)
            .cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        Ok(self.workflows.lock().unwrap().clone())
    }

    async fn get_workflow(
        &self,
        id: &uuid::Uuid,
    ) -> Result<Option<WorkflowRecord>, RepositoryError> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .iter()
            .find(|w| &w.id == id)
            .cloned())
    }

    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| RepositoryError::NotFound(run_id.to_string()))?;
        run.status = status;
        run.end_time = end_time;
        run.error = error.map(String::from);
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned())
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let runs = self.runs.lock().unwrap();
        Ok(runs
            .iter()
            .filter(|r| workflow_name.is_none_or(|n| r.workflow_name == n))
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), RepositoryError> {
        let mut runs = self.runs.lock().unwrap();
        let Some(idx) = runs.iter().position(|r| r.run_id == run_id) else {
            return Err(RepositoryError::NotFound(run_id.to_string()));
        };
        if !runs[idx].status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is {}",
                runs[idx].status
            )));
        }
        runs.remove(idx);
        self.steps.lock().unwrap().retain(|s| s.run_id != run_id);
        Ok(())
    }

    async fn add_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        self.steps.lock().unwrap().push(step.clone());
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut steps = self.steps.lock().unwrap();
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        run_id: &str,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        Ok(self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }
}
