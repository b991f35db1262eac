//! Workflow registration and run-launch handlers.

use std::collections::HashMap;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use uuid::Uuid;

use bioflow_core::execution::engine::RunOptions;
use bioflow_core::execution::run_dir::generate_run_id;
use bioflow_core::repository::RunRepository;
use bioflow_core::workflow::definition::validate_definition;
use bioflow_types::run::WorkflowRecord;
use bioflow_types::workflow::WorkflowDefinition;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of `POST /workflows/{id}/run`.
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    /// Input overrides, merged over the declared inputs.
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    /// Maximum steps in flight.
    #[serde(default = "default_parallel")]
    pub parallel: usize,
}

fn default_parallel() -> usize {
    1
}

/// POST /api/v1/workflows - register a workflow definition.
///
/// Registration is idempotent: posting an already-known `(name, version)`
/// returns the stored row.
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(def): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<WorkflowRecord>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    validate_definition(&def).map_err(|e| AppError::Validation(e.to_string()))?;

    let record = WorkflowRecord {
        id: Uuid::now_v7(),
        name: def.name.clone(),
        version: def.version.clone(),
        description: def.description.clone(),
        definition: serde_json::to_value(&def)
            .map_err(|e| AppError::Internal(e.to_string()))?,
        created_at: chrono::Utc::now(),
    };
    let stored = state.repo.create_workflow(&record).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(stored, request_id, elapsed)))
}

/// GET /api/v1/workflows - list registered workflows.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkflowRecord>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflows = state.repo.list_workflows().await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(workflows, request_id, elapsed)))
}

/// GET /api/v1/workflows/{id} - get one workflow definition.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowRecord>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflow = state
        .repo
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {id} not found")))?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(workflow, request_id, elapsed)))
}

/// POST /api/v1/workflows/{id}/run - launch a run on a background task.
///
/// Returns the allocated run ID immediately; poll `GET /runs/{id}` for
/// progress.
pub async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RunRequest>>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let Json(request) = body.unwrap_or_default();

    let workflow = state
        .repo
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {id} not found")))?;

    let def: WorkflowDefinition = serde_json::from_value(workflow.definition.clone())
        .map_err(|e| AppError::Internal(format!("stored definition is invalid: {e}")))?;

    let run_id = generate_run_id();
    let options = RunOptions {
        inputs: request.inputs,
        parallel: request.parallel,
        run_id: Some(run_id.clone()),
    };

    let engine = state.engine.clone();
    let background_run_id = run_id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run(&def, options).await {
            tracing::error!(run_id = background_run_id.as_str(), error = %e, "background run failed");
        }
    });

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        serde_json::json!({
            "run_id": run_id,
            "workflow_id": workflow.id,
            "workflow_name": workflow.name,
            "status": "PENDING",
        }),
        request_id,
        elapsed,
    )))
}
