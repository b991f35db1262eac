//! Application state wiring pool -> repository -> engine.
//!
//! `AppState` pins the engine generics to the concrete production pieces:
//! the Docker driver and the SQLite repository. Both the CLI commands and
//! the REST handlers go through it.

use std::path::PathBuf;
use std::sync::Arc;

use bioflow_core::execution::container::DockerDriver;
use bioflow_core::execution::engine::{EngineConfig, WorkflowEngine};
use bioflow_core::repository::RunRepository;
use bioflow_infra::{DatabasePool, SqliteRunRepository};
use bioflow_types::run::RunStatus;
use chrono::Utc;

/// Concrete engine type used by the CLI and the REST API.
pub type ConcreteEngine = WorkflowEngine<DockerDriver, SqliteRunRepository>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub repo: SqliteRunRepository,
    pub base_dir: PathBuf,
}

impl AppState {
    /// Initialize with the default engine configuration.
    pub async fn init(base_dir: PathBuf) -> anyhow::Result<Self> {
        Self::init_with(EngineConfig::new(base_dir)).await
    }

    /// Initialize with an explicit engine configuration: open and migrate
    /// the database, sweep runs interrupted by a previous process, and wire
    /// the engine.
    pub async fn init_with(config: EngineConfig) -> anyhow::Result<Self> {
        let base_dir = config.base_dir.clone();
        tokio::fs::create_dir_all(&base_dir).await?;

        let db_url = format!(
            "sqlite://{}?mode=rwc",
            base_dir.join("bioflow.db").display()
        );
        let pool = DatabasePool::new(&db_url).await?;
        let repo = SqliteRunRepository::new(pool);

        // A run left RUNNING by a dead process can never finish; record it
        // as ERROR so it becomes resumable.
        sweep_interrupted_runs(&repo).await;

        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(DockerDriver::new()),
            repo.clone(),
            config,
        ));

        Ok(Self {
            engine,
            repo,
            base_dir,
        })
    }
}

async fn sweep_interrupted_runs(repo: &SqliteRunRepository) {
    match repo.list_runs(None, u32::MAX).await {
        Ok(runs) => {
            let interrupted: Vec<_> = runs
                .into_iter()
                .filter(|r| r.status == RunStatus::Running)
                .collect();
            for run in &interrupted {
                let _ = repo
                    .update_run_status(
                        &run.run_id,
                        RunStatus::Error,
                        Some(Utc::now()),
                        Some("process exited while run was in flight"),
                    )
                    .await;
            }
            if !interrupted.is_empty() {
                tracing::warn!(
                    count = interrupted.len(),
                    "marked interrupted runs as ERROR"
                );
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to check for interrupted runs");
        }
    }
}
