//! Claim-once firing queue.
//!
//! The broker guarantees that each published firing is executed by at most
//! one worker at a time: a worker *leases* a firing, holds it until it acks
//! or nacks, and a background sweep returns expired leases to the queue.
//! Two bindings of the same contract exist: [`FiringQueue`] in-process and
//! [`http::HttpBroker`] over the control-plane HTTP API.

pub mod error;
pub mod http;
pub mod queue;

pub use error::BrokerError;
pub use queue::{FiringQueue, LEASE_GRACE_MS, MAX_ATTEMPTS, MIN_LEASE_MS, SWEEP_INTERVAL};

use std::time::Duration;

use async_trait::async_trait;
use runinator_core::{DeadFiring, Firing};
use serde::{Deserialize, Serialize};

/// Result of a publish: the firing's id, and whether an identical firing
/// (same task and slot) was already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub id: u64,
    pub duplicate: bool,
}

/// A firing handed to exactly one consumer, with the token that proves the
/// claim on ack/nack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedFiring {
    #[serde(flatten)]
    pub firing: Firing,
    pub lease_token: String,
}

/// Whether an ack/nack was applied or arrived with a token the broker no
/// longer recognizes (lease expired and possibly reassigned).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Acked,
    Stale,
}

/// The broker contract shared by the in-memory queue and the HTTP client.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Enqueue a firing. Publishing the same `(task_id, scheduled_for)`
    /// again while the first firing is not terminal is a no-op that
    /// returns the existing id.
    async fn publish(&self, firing: Firing) -> Result<PublishReceipt, BrokerError>;

    /// Wait up to `max_wait` for a pending firing and claim it. Ordering
    /// is FIFO by `(scheduled_for, publish sequence)`.
    async fn lease(
        &self,
        consumer_id: &str,
        max_wait: Duration,
    ) -> Result<Option<LeasedFiring>, BrokerError>;

    /// Remove a leased firing. Stale tokens leave state untouched.
    async fn ack(&self, firing_id: u64, lease_token: &str) -> Result<AckStatus, BrokerError>;

    /// Give a leased firing back: requeue for another attempt, or drop it
    /// to the dead bucket with a reason.
    async fn nack(
        &self,
        firing_id: u64,
        lease_token: &str,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<AckStatus, BrokerError>;

    /// Firings that exhausted their attempts or were dropped explicitly.
    async fn list_dead(&self) -> Result<Vec<DeadFiring>, BrokerError>;
}
