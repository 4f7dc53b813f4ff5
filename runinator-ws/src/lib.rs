//! Runinator web service.
//!
//! Owns the SQL persistence of tasks and run history and exposes the JSON
//! API the scheduler, worker, importer and command center consume.

pub mod repository;
mod routes;

pub use repository::TaskRepository;

use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Build the task API router.
pub fn router(repository: TaskRepository) -> Router {
    Router::new()
        .route("/tasks", get(routes::get_tasks).post(routes::add_task))
        .route(
            "/tasks/{id}",
            patch(routes::patch_task).delete(routes::delete_task),
        )
        .route("/tasks/{id}/request_run", post(routes::request_run))
        .route(
            "/task_runs",
            get(routes::get_task_runs).post(routes::add_task_run),
        )
        .route("/health", get(routes::health))
        .with_state(repository)
}

/// Serve the API until the shutdown signal flips.
pub async fn serve(
    listener: TcpListener,
    repository: TaskRepository,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(repository))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
