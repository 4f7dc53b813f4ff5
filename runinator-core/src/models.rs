//! Persistent task and run-history records, plus the API envelopes the web
//! service exchanges with the other services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cron::{CronExpression, ParseError};

/// A registered task: what to run, when, and with which payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Database identity; `None` until the web service assigns one.
    #[serde(default)]
    pub id: Option<i64>,
    /// Unique human-readable name.
    pub name: String,
    /// 5-field cron expression, validated at insert.
    pub cron_schedule: String,
    /// Handler family, e.g. `"Console"`.
    pub action_name: String,
    /// Function within the family, e.g. `"run_console"`.
    pub action_function: String,
    /// Opaque payload handed to the handler.
    #[serde(default)]
    pub action_configuration: Vec<u8>,
    /// Wall-clock budget for one run, in milliseconds.
    pub timeout_ms: i64,
    /// Cached next fire time; `None` means not yet scheduled.
    #[serde(default)]
    pub next_execution: Option<DateTime<Utc>>,
    /// Disabled tasks are never published.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Why a task definition was rejected.
#[derive(Debug, Error)]
pub enum InvalidTask {
    #[error("task name must not be empty")]
    EmptyName,
    #[error("timeout_ms must be positive, got {0}")]
    NonPositiveTimeout(i64),
    #[error("cron schedule does not parse: {0}")]
    Schedule(#[from] ParseError),
}

impl ScheduledTask {
    /// Check the insert-time invariants: non-empty name, positive timeout,
    /// parseable cron expression.
    pub fn validate(&self) -> Result<(), InvalidTask> {
        if self.name.trim().is_empty() {
            return Err(InvalidTask::EmptyName);
        }
        if self.timeout_ms <= 0 {
            return Err(InvalidTask::NonPositiveTimeout(self.timeout_ms));
        }
        CronExpression::parse(&self.cron_schedule)?;
        Ok(())
    }
}

/// One completed invocation, appended by the worker. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
}

/// The worker's run report, before the web service assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunReport {
    pub task_id: i64,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Partial task update for `PATCH /tasks/{id}`. Absent fields are left
/// untouched; `next_execution` uses the double-`Option` convention so an
/// explicit JSON `null` clears the cached fire time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_configuration: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub next_execution: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl TaskPatch {
    /// A patch that only moves the cached next fire time.
    pub fn next_execution(next: Option<DateTime<Utc>>) -> Self {
        Self {
            next_execution: Some(next),
            ..Self::default()
        }
    }
}

/// Distinguishes "field absent" from "field present and null".
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Mutation acknowledgement returned by the web service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAck {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl TaskAck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            id: None,
        }
    }

    pub fn created(message: impl Into<String>, id: i64) -> Self {
        Self {
            success: true,
            message: message.into(),
            id: Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_task() -> ScheduledTask {
        ScheduledTask {
            id: Some(7),
            name: "nightly-report".into(),
            cron_schedule: "0 3 * * *".into(),
            action_name: "Console".into(),
            action_function: "run_console".into(),
            action_configuration: b"echo report".to_vec(),
            timeout_ms: 30_000,
            next_execution: Some(Utc.with_ymd_and_hms(2025, 1, 17, 3, 0, 0).unwrap()),
            enabled: true,
        }
    }

    #[test]
    fn task_json_round_trip() {
        let task = sample_task();
        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: ScheduledTask = serde_json::from_str(&encoded).unwrap();
        assert_eq!(task, decoded);
    }

    #[test]
    fn validation_rejects_bad_tasks() {
        let mut task = sample_task();
        task.name = "  ".into();
        assert!(matches!(task.validate(), Err(InvalidTask::EmptyName)));

        let mut task = sample_task();
        task.timeout_ms = 0;
        assert!(matches!(
            task.validate(),
            Err(InvalidTask::NonPositiveTimeout(0))
        ));

        let mut task = sample_task();
        task.cron_schedule = "not cron".into();
        assert!(matches!(task.validate(), Err(InvalidTask::Schedule(_))));

        assert!(sample_task().validate().is_ok());
    }

    #[test]
    fn patch_distinguishes_absent_from_null() {
        let absent: TaskPatch = serde_json::from_str(r#"{"enabled":false}"#).unwrap();
        assert!(absent.next_execution.is_none());
        assert_eq!(absent.enabled, Some(false));

        let cleared: TaskPatch = serde_json::from_str(r#"{"next_execution":null}"#).unwrap();
        assert_eq!(cleared.next_execution, Some(None));
    }
}
