//! One scheduled occurrence of a task, as carried by the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ScheduledTask;

/// A firing travels from the scheduler through the broker to a worker.
/// The broker assigns `id` at publish time and bumps `attempt` on every
/// redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firing {
    #[serde(default)]
    pub id: u64,
    pub task_id: i64,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub attempt: u32,
    pub action_name: String,
    pub action_function: String,
    #[serde(default)]
    pub configuration: Vec<u8>,
    pub timeout_ms: i64,
}

impl Firing {
    /// Build the firing for one slot of a task. Returns `None` when the
    /// task has not been persisted yet (no id to fire against).
    pub fn for_task(task: &ScheduledTask, scheduled_for: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            id: 0,
            task_id: task.id?,
            scheduled_for,
            attempt: 0,
            action_name: task.action_name.clone(),
            action_function: task.action_function.clone(),
            configuration: task.action_configuration.clone(),
            timeout_ms: task.timeout_ms,
        })
    }

    /// Publish deduplication key: one live firing per task and slot.
    pub fn idempotency_key(&self) -> (i64, i64) {
        (self.task_id, self.scheduled_for.timestamp())
    }
}

/// A firing that exhausted its attempts or was dropped explicitly.
/// Retained for observation, never re-leased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadFiring {
    pub firing: Firing,
    pub reason: String,
    pub died_at: DateTime<Utc>,
}
