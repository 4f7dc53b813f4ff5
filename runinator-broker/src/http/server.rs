//! Axum surface over the in-memory queue.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use runinator_core::Firing;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::http::types::{AckRequest, ErrorBody, LeaseQuery, NackRequest, PublishResponse};
use crate::{AckStatus, Broker, FiringQueue};

/// Longest lease long-poll the server will hold a connection for.
const MAX_LEASE_WAIT: Duration = Duration::from_secs(30);

/// Build the broker control-plane router.
pub fn router(queue: FiringQueue) -> Router {
    Router::new()
        .route("/publish", post(publish))
        .route("/lease", post(lease))
        .route("/ack/{firing_id}", post(ack))
        .route("/nack/{firing_id}", post(nack))
        .route("/dead", get(dead))
        .route("/health", get(health))
        .with_state(queue)
}

/// Serve the router until the shutdown signal flips.
pub async fn serve(
    listener: TcpListener,
    queue: FiringQueue,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(queue))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn publish(State(queue): State<FiringQueue>, Json(firing): Json<Firing>) -> Response {
    match queue.publish(firing).await {
        Ok(receipt) => {
            let status = if receipt.duplicate {
                StatusCode::CONFLICT
            } else {
                StatusCode::CREATED
            };
            (status, Json(PublishResponse { id: receipt.id })).into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn lease(State(queue): State<FiringQueue>, Query(query): Query<LeaseQuery>) -> Response {
    let wait = Duration::from_millis(query.wait_ms).min(MAX_LEASE_WAIT);
    match queue.lease(&query.consumer_id, wait).await {
        Ok(Some(leased)) => (StatusCode::OK, Json(leased)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(err),
    }
}

async fn ack(
    State(queue): State<FiringQueue>,
    Path(firing_id): Path<u64>,
    Json(request): Json<AckRequest>,
) -> Response {
    match queue.ack(firing_id, &request.lease_token).await {
        Ok(AckStatus::Acked) => StatusCode::OK.into_response(),
        Ok(AckStatus::Stale) => stale_response(firing_id),
        Err(err) => internal_error(err),
    }
}

async fn nack(
    State(queue): State<FiringQueue>,
    Path(firing_id): Path<u64>,
    Json(request): Json<NackRequest>,
) -> Response {
    match queue
        .nack(
            firing_id,
            &request.lease_token,
            request.requeue,
            request.reason,
        )
        .await
    {
        Ok(AckStatus::Acked) => StatusCode::OK.into_response(),
        Ok(AckStatus::Stale) => stale_response(firing_id),
        Err(err) => internal_error(err),
    }
}

async fn dead(State(queue): State<FiringQueue>) -> Response {
    match queue.list_dead().await {
        Ok(dead) => Json(dead).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn health() -> Response {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })).into_response()
}

fn stale_response(firing_id: u64) -> Response {
    (
        StatusCode::GONE,
        Json(ErrorBody {
            message: format!("lease on firing {firing_id} is stale"),
        }),
    )
        .into_response()
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
        .into_response()
}
