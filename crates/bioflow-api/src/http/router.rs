//! Axum router configuration with middleware.
//!
//! All REST routes are under `/api/v1/`. Middleware: CORS and request
//! tracing.

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workflows
        .route("/workflows", get(handlers::workflow::list_workflows))
        .route("/workflows", post(handlers::workflow::create_workflow))
        .route("/workflows/{id}", get(handlers::workflow::get_workflow))
        .route("/workflows/{id}/run", post(handlers::workflow::run_workflow))
        // Runs
        .route("/runs", get(handlers::run::list_runs))
        .route("/runs/{run_id}", get(handlers::run::get_run))
        .route("/runs/{run_id}", delete(handlers::run::delete_run))
        .route("/runs/{run_id}/steps", get(handlers::run::get_run_steps))
        .route("/runs/{run_id}/logs/{step}", get(handlers::run::get_step_log))
        .route("/runs/{run_id}/resume", post(handlers::run::resume_run))
        .route("/runs/{run_id}/cancel", post(handlers::run::cancel_run));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - simple liveness probe.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
