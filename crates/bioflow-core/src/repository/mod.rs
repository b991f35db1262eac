//! Repository trait for run-history persistence.
//!
//! Defines the storage interface consumed by the engine. The infrastructure
//! layer (`bioflow-infra`) implements it with SQLite. Every update is an
//! idempotent upsert keyed by the natural identifier; registering an
//! already-known `(name, version)` workflow returns the existing row.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use bioflow_types::error::RepositoryError;
use bioflow_types::run::{RunRecord, RunStatus, StepExecution, WorkflowRecord};
use chrono::{DateTime, Utc};

/// Storage interface for workflows, runs, and step executions.
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Register a workflow. If `(name, version)` already exists the stored
    /// row is returned unchanged.
    fn create_workflow(
        &self,
        record: &WorkflowRecord,
    ) -> impl std::future::Future<Output = Result<WorkflowRecord, RepositoryError>> + Send;

    /// Look up a workflow by its natural key.
    fn get_workflow_by_name_version(
        &self,
        name: &str,
        version: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRecord>, RepositoryError>> + Send;

    /// List all registered workflows, newest first.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRecord>, RepositoryError>> + Send;

    /// Look up a workflow by surrogate ID.
    fn get_workflow(
        &self,
        id: &uuid::Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record.
    fn create_run(
        &self,
        run: &RunRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update a run's status. `end_time` and `error` overwrite the stored
    /// values (passing `None` clears them, which resume relies on).
    fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its run ID.
    fn get_run(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by workflow name.
    fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    /// Delete a run and its step executions. Fails with
    /// [`RepositoryError::Conflict`] unless the run is terminal.
    fn delete_run(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Insert a step execution row.
    fn add_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Upsert a step execution row by its ID.
    fn update_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all step executions for a run, oldest first.
    fn list_step_executions(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Arc forwarding
// ---------------------------------------------------------------------------

/// A shared repository handle is itself a repository, so the engine and the
/// API layer can hold the same instance.
impl<R: RunRepository> RunRepository for std::sync::Arc<R> {
    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
    ) -> Result<WorkflowRecord, RepositoryError> {
        (**self).create_workflow(record).await
    }

    async fn get_workflow_by_name_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowRecord>, RepositoryError> {
        (**self).get_workflow_by_name_version(name, version).await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        (**self).list_workflows().await
    }

    async fn get_workflow(
        &self,
        id: &uuid::Uuid,
    ) -> Result<Option<WorkflowRecord>, RepositoryError> {
        (**self).get_workflow(id).await
    }

    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        (**self).create_run(run).await
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        (**self).update_run_status(run_id, status, end_time, error).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, RepositoryError> {
        (**self).get_run(run_id).await
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        (**self).list_runs(workflow_name, limit).await
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), RepositoryError> {
        (**self).delete_run(run_id).await
    }

    async fn add_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        (**self).add_step_execution(step).await
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        (**self).update_step_execution(step).await
    }

    async fn list_step_executions(
        &self,
        run_id: &str,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        (**self).list_step_executions(run_id).await
    }
}
