//! Durable checkpointing of run and step state.
//!
//! Wraps the [`RunRepository`] to give the scheduler a higher-level API for
//! recording state transitions. Every repository call is retried once on
//! failure; a second failure propagates and aborts the run as `ERROR`.

use bioflow_types::error::RepositoryError;
use bioflow_types::run::{RunStatus, StepExecution, StepStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::RunRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The underlying repository failed twice in a row.
    #[error("checkpoint repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists run/step transitions through a repository, retrying each failed
/// call once before giving up.
pub struct CheckpointManager<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    async fn retry<T, F, Fut>(&self, op: &str, f: F) -> Result<T, CheckpointError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RepositoryError>>,
    {
        match f().await {
            Ok(v) => Ok(v),
            Err(first) => {
                tracing::warn!(op, error = %first, "repository call failed, retrying once");
                f().await.map_err(|second| {
                    tracing::error!(op, error = %second, "repository call failed twice");
                    CheckpointError::Repository(second.to_string())
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Record a step entering `RUNNING`. Returns the created row.
    pub async fn step_started(
        &self,
        run_id: &str,
        step_name: &str,
        attempt: u32,
        log_file: &str,
    ) -> Result<StepExecution, CheckpointError> {
        let exec = StepExecution {
            id: Uuid::now_v7(),
            run_id: run_id.to_string(),
            step_name: step_name.to_string(),
            status: StepStatus::Running,
            attempt,
            start_time: Some(Utc::now()),
            end_time: None,
            exit_code: None,
            error: None,
            log_file: Some(log_file.to_string()),
            outputs: Vec::new(),
        };

        self.retry("add_step_execution", || self.repo.add_step_execution(&exec))
            .await?;

        tracing::debug!(run_id, step = step_name, attempt, "checkpointed step start");
        Ok(exec)
    }

    /// Persist a step's terminal state.
    pub async fn step_finished(&self, exec: &StepExecution) -> Result<(), CheckpointError> {
        self.retry("update_step_execution", || {
            self.repo.update_step_execution(exec)
        })
        .await?;

        tracing::debug!(
            run_id = exec.run_id.as_str(),
            step = exec.step_name.as_str(),
            status = %exec.status,
            "checkpointed step finish"
        );
        Ok(())
    }

    /// Record a step as `SKIPPED` without it ever running.
    pub async fn step_skipped(
        &self,
        run_id: &str,
        step_name: &str,
        attempt: u32,
        reason: &str,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let exec = StepExecution {
            id: Uuid::now_v7(),
            run_id: run_id.to_string(),
            step_name: step_name.to_string(),
            status: StepStatus::Skipped,
            attempt,
            start_time: Some(now),
            end_time: Some(now),
            exit_code: None,
            error: Some(reason.to_string()),
            log_file: None,
            outputs: Vec::new(),
        };

        self.retry("add_step_execution", || self.repo.add_step_execution(&exec))
            .await?;

        tracing::debug!(run_id, step = step_name, reason, "checkpointed step skipped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Update the overall run status.
    pub async fn run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<(), CheckpointError> {
        self.retry("update_run_status", || {
            self.repo.update_run_status(run_id, status, end_time, error)
        })
        .await?;

        tracing::debug!(run_id, status = %status, "checkpointed run status");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bioflow_types::run::{RunRecord, WorkflowRecord};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Repository that fails the first `fail_times` calls of each operation.
    #[derive(Default)]
    struct FlakyRepository {
        fail_times: u32,
        calls: AtomicU32,
        rows: Mutex<Vec<StepExecution>>,
    }

    impl FlakyRepository {
        fn failing(fail_times: u32) -> Self {
            Self {
                fail_times,
                ..Default::default()
            }
        }

        fn maybe_fail(&self) -> Result<(), RepositoryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(RepositoryError::Database("connection lost".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl RunRepository for FlakyRepository {
        async fn create_workflow(
            &self,
            record: &WorkflowRecord,
        ) -> Result<WorkflowRecord, RepositoryError> {
            self.maybe_fail()?;
            Ok(record.clone())
        }

        async fn get_workflow_by_name_version(
            &self,
            _name: &str,
            _version: &str,
        ) -> Result<Option<WorkflowRecord>, RepositoryError> {
            Ok(None)
        }

        async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn get_workflow(
            &self,
            _id: &Uuid,
        ) -> Result<Option<WorkflowRecord>, RepositoryError> {
            Ok(None)
        }

        async fn create_run(&self, _run: &RunRecord) -> Result<(), RepositoryError> {
            self.maybe_fail()
        }

        async fn update_run_status(
            &self,
            _run_id: &str,
            _status: RunStatus,
            _end_time: Option<DateTime<Utc>>,
            _error: Option<&str>,
        ) -> Result<(), RepositoryError> {
            self.maybe_fail()
        }

        async fn get_run(&self, _run_id: &str) -> Result<Option<RunRecord>, RepositoryError> {
            Ok(None)
        }

        async fn list_runs(
            &self,
            _workflow_name: Option<&str>,
            _limit: u32,
        ) -> Result<Vec<RunRecord>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn delete_run(&self, _run_id: &str) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn add_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
            self.maybe_fail()?;
            self.rows.lock().unwrap().push(step.clone());
            Ok(())
        }

        async fn update_step_execution(
            &self,
            step: &StepExecution,
        ) -> Result<(), RepositoryError> {
            self.maybe_fail()?;
            self.rows.lock().unwrap().push(step.clone());
            Ok(())
        }

        async fn list_step_executions(
            &self,
            _run_id: &str,
        ) -> Result<Vec<StepExecution>, RepositoryError> {
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_step_started_creates_running_row() {
        let checkpoint = CheckpointManager::new(FlakyRepository::failing(0));
        let exec = checkpoint
            .step_started("run1", "align", 1, "/logs/align.log")
            .await
            .unwrap();

        assert_eq!(exec.status, StepStatus::Running);
        assert_eq!(exec.attempt, 1);
        assert!(exec.start_time.is_some());
        assert!(exec.end_time.is_none());
    }

    #[tokio::test]
    async fn test_single_failure_is_retried() {
        let checkpoint = CheckpointManager::new(FlakyRepository::failing(1));
        let result = checkpoint
            .step_started("run1", "align", 1, "/logs/align.log")
            .await;
        assert!(result.is_ok(), "one failure should be absorbed by the retry");
    }

    #[tokio::test]
    async fn test_two_failures_abort() {
        let checkpoint = CheckpointManager::new(FlakyRepository::failing(2));
        let result = checkpoint
            .step_started("run1", "align", 1, "/logs/align.log")
            .await;
        assert!(matches!(result, Err(CheckpointError::Repository(_))));
    }

    #[tokio::test]
    async fn test_step_skipped_records_reason() {
        let checkpoint = CheckpointManager::new(FlakyRepository::failing(0));
        checkpoint
            .step_skipped("run1", "call", 1, "dependency 'align' did not complete")
            .await
            .unwrap();

        let rows = checkpoint.repo().rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, StepStatus::Skipped);
        assert!(rows[0].error.as_deref().unwrap().contains("align"));
    }
}
