//! Run inspection and management handlers.

use std::collections::HashMap;
use std::path::{Component, Path as FsPath, PathBuf};
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use bioflow_core::execution::engine::StepOverride;
use bioflow_core::repository::RunRepository;
use bioflow_types::run::{RunRecord, StepExecution};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query / body types
// ---------------------------------------------------------------------------

/// Query parameters for `GET /runs`.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Filter by workflow name.
    pub workflow: Option<String>,
    /// Maximum number of runs to return.
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

/// Body of `POST /runs/{id}/resume`.
#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    /// Per-step command/resource replacements for the new attempt.
    #[serde(default)]
    pub step_overrides: HashMap<String, StepOverride>,
    /// Maximum steps in flight.
    #[serde(default = "default_parallel")]
    pub parallel: usize,
}

fn default_parallel() -> usize {
    1
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/v1/runs - list runs, optionally filtered by workflow name.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ApiResponse<Vec<RunRecord>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let runs = state
        .engine
        .list(query.workflow.as_deref(), query.limit)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(runs, request_id, elapsed)))
}

/// GET /api/v1/runs/{run_id} - run detail with step executions.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let (run, steps) = state.engine.status(&run_id).await?;

    let mut run_json =
        serde_json::to_value(&run).map_err(|e| AppError::Internal(e.to_string()))?;
    run_json["steps"] =
        serde_json::to_value(&steps).map_err(|e| AppError::Internal(e.to_string()))?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(run_json, request_id, elapsed)))
}

/// GET /api/v1/runs/{run_id}/steps - step executions for a run.
pub async fn get_run_steps(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<StepExecution>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let (_, steps) = state.engine.status(&run_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(steps, request_id, elapsed)))
}

/// GET /api/v1/runs/{run_id}/logs/{step} - the step's log file contents.
pub async fn get_step_log(
    State(state): State<AppState>,
    Path((run_id, step)): Path<(String, String)>,
) -> Result<String, AppError> {
    let (run, _) = state.engine.status(&run_id).await?;

    let log_path = step_log_path(&run.run_dir, &step)
        .ok_or_else(|| AppError::Validation(format!("invalid step name '{step}'")))?;

    match tokio::fs::read_to_string(&log_path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound(format!(
            "no log recorded for step '{step}' of run {run_id}"
        ))),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}

/// Resolve `logs/<step>.log` inside the run directory, rejecting step names
/// that would escape it.
fn step_log_path(run_dir: &str, step: &str) -> Option<PathBuf> {
    let file = FsPath::new(step);
    let mut components = file.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {
            Some(FsPath::new(run_dir).join("logs").join(format!("{step}.log")))
        }
        _ => None,
    }
}

/// POST /api/v1/runs/{run_id}/resume - re-execute the non-completed tail.
///
/// The resumed execution proceeds on a background task; the response
/// reports the run as RUNNING.
pub async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Option<Json<ResumeRequest>>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let Json(request) = body.unwrap_or_default();

    // Surface not-found / still-running as proper HTTP errors before
    // detaching the actual work.
    let run = state
        .repo
        .get_run(&run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("run {run_id} not found")))?;
    if run.status == bioflow_types::run::RunStatus::Running {
        return Err(AppError::Conflict(format!("run {run_id} is still RUNNING")));
    }

    let engine = state.engine.clone();
    let background_run_id = run_id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine
            .resume(&background_run_id, &request.step_overrides, request.parallel)
            .await
        {
            tracing::error!(run_id = background_run_id.as_str(), error = %e, "resume failed");
        }
    });

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "run_id": run_id, "status": "RUNNING" }),
        request_id,
        elapsed,
    )))
}

/// POST /api/v1/runs/{run_id}/cancel - cancel an in-flight run.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.engine.cancel(&run_id)?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "run_id": run_id, "cancelled": true }),
        request_id,
        elapsed,
    )))
}

/// DELETE /api/v1/runs/{run_id} - delete a terminal run (409 otherwise).
pub async fn delete_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.repo.delete_run(&run_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "run_id": run_id, "deleted": true }),
        request_id,
        elapsed,
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_log_path_plain_name() {
        let path = step_log_path("/data/runs/wf/1.0.0/run1", "align").unwrap();
        assert!(path.ends_with("runs/wf/1.0.0/run1/logs/align.log"));
    }

    #[test]
    fn test_step_log_path_rejects_traversal() {
        assert!(step_log_path("/data/runs/wf/1.0.0/run1", "../secrets").is_none());
        assert!(step_log_path("/data/runs/wf/1.0.0/run1", "a/b").is_none());
        assert!(step_log_path("/data/runs/wf/1.0.0/run1", "/etc/passwd").is_none());
    }
}
