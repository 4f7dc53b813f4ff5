//! HTTP handlers for the task API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use runinator_core::{CronExpression, ScheduledTask, TaskAck, TaskPatch, TaskRunReport};
use serde::Deserialize;
use serde_json::json;

use crate::repository::TaskRepository;

#[derive(Debug, Deserialize)]
pub struct RunWindow {
    #[serde(default)]
    pub start_time: i64,
    #[serde(default = "default_end_time")]
    pub end_time: i64,
}

fn default_end_time() -> i64 {
    i64::MAX
}

pub async fn get_tasks(State(repository): State<TaskRepository>) -> Response {
    match repository.list_tasks().await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn add_task(
    State(repository): State<TaskRepository>,
    Json(mut task): Json<ScheduledTask>,
) -> Response {
    if let Err(err) = task.validate() {
        return failure(StatusCode::BAD_REQUEST, err);
    }

    // A fresh task without a cached fire time gets the next cron slot so
    // the scheduler picks it up without a warm-up pass.
    if task.next_execution.is_none() {
        let cron = match CronExpression::parse(&task.cron_schedule) {
            Ok(cron) => cron,
            Err(err) => return failure(StatusCode::BAD_REQUEST, err),
        };
        task.next_execution = cron.next_after(Utc::now());
    }

    task.id = None;
    match repository.insert_task(task).await {
        Ok(id) => Json(TaskAck::created("task created", id)).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn patch_task(
    State(repository): State<TaskRepository>,
    Path(task_id): Path<i64>,
    Json(patch): Json<TaskPatch>,
) -> Response {
    if let Some(cron_schedule) = patch.cron_schedule.as_deref() {
        if let Err(err) = CronExpression::parse(cron_schedule) {
            return failure(StatusCode::BAD_REQUEST, err);
        }
    }
    if let Some(timeout_ms) = patch.timeout_ms {
        if timeout_ms <= 0 {
            return failure(StatusCode::BAD_REQUEST, "timeout_ms must be positive");
        }
    }

    match repository.patch_task(task_id, patch).await {
        Ok(true) => Json(TaskAck::ok("task updated")).into_response(),
        Ok(false) => not_found(task_id),
        Err(err) => internal_error(err),
    }
}

pub async fn delete_task(
    State(repository): State<TaskRepository>,
    Path(task_id): Path<i64>,
) -> Response {
    match repository.delete_task(task_id).await {
        Ok(true) => Json(TaskAck::ok("task deleted")).into_response(),
        Ok(false) => not_found(task_id),
        Err(err) => internal_error(err),
    }
}

/// Rewind the cached fire time to now; the scheduler publishes the firing
/// on its next tick, then advances the task back onto its cron grid.
pub async fn request_run(
    State(repository): State<TaskRepository>,
    Path(task_id): Path<i64>,
) -> Response {
    tracing::info!(task_id, "immediate run requested");
    let patch = TaskPatch::next_execution(Some(Utc::now()));
    match repository.patch_task(task_id, patch).await {
        Ok(true) => Json(TaskAck::ok("run requested")).into_response(),
        Ok(false) => not_found(task_id),
        Err(err) => internal_error(err),
    }
}

pub async fn add_task_run(
    State(repository): State<TaskRepository>,
    Json(report): Json<TaskRunReport>,
) -> Response {
    match repository.insert_run(report).await {
        Ok(id) => Json(TaskAck::created("run recorded", id)).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn get_task_runs(
    State(repository): State<TaskRepository>,
    Query(window): Query<RunWindow>,
) -> Response {
    match repository.list_runs(window.start_time, window.end_time).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn health() -> Response {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })).into_response()
}

fn failure(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "message": err.to_string() }))).into_response()
}

fn not_found(task_id: i64) -> Response {
    failure(
        StatusCode::NOT_FOUND,
        format!("no task with id {task_id}"),
    )
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "request failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, err)
}
