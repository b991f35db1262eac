//! REST API under `/api/v1`.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;

use crate::state::AppState;

/// Bind and serve the API until the process is stopped.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router::build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = addr.as_str(), "REST API listening");
    println!("BioinfoFlow API listening on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
