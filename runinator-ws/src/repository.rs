//! SQLite persistence for tasks and run history.
//!
//! Each operation opens its own connection inside the blocking thread
//! pool; WAL mode handles concurrent access. Datetimes are stored as epoch
//! seconds, `action_configuration` as a BLOB.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use runinator_core::{ScheduledTask, TaskPatch, TaskRun, TaskRunReport};
use tokio::task;

/// Repository over the `scheduled_tasks` and `task_runs` tables.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    db_path: PathBuf,
}

impl TaskRepository {
    /// Open (or create) the database and apply the schema.
    ///
    /// Accepts `:memory:` for tests; a shared-cache URI keeps all
    /// connections on the same in-memory database.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let mut db_path = path.into();
        if db_path.to_str() == Some(":memory:") {
            db_path = PathBuf::from("file::memory:?cache=shared");
        }

        let repository = Self { db_path };
        repository.migrate_schema().await?;
        Ok(repository)
    }

    async fn migrate_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("Failed to enable WAL mode")?;

            conn.execute(
                r"
                CREATE TABLE IF NOT EXISTS scheduled_tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    cron_schedule TEXT NOT NULL,
                    action_name TEXT NOT NULL,
                    action_function TEXT NOT NULL,
                    action_configuration BLOB NOT NULL,
                    timeout INTEGER NOT NULL,
                    next_execution INTEGER NULL,
                    enabled BOOL NOT NULL DEFAULT 1
                )
                ",
                [],
            )
            .context("Failed to create scheduled_tasks table")?;

            conn.execute(
                r"
                CREATE TABLE IF NOT EXISTS task_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES scheduled_tasks(id),
                    start_time INTEGER NOT NULL,
                    duration_ms INTEGER NOT NULL
                )
                ",
                [],
            )
            .context("Failed to create task_runs table")?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_task_runs_start ON task_runs(start_time)",
                [],
            )
            .context("Failed to create task_runs index")?;

            Ok(())
        })
        .await
    }

    /// Run `f` against a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("Failed to open database")?;
            f(&conn)
        })
        .await
        .context("Database task panicked")?
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.with_conn(|conn| {
            let mut statement = conn.prepare(
                "SELECT id, name, cron_schedule, action_name, action_function,
                        action_configuration, timeout, next_execution, enabled
                 FROM scheduled_tasks ORDER BY id",
            )?;
            let tasks = statement
                .query_map([], task_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
        .await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<ScheduledTask>> {
        self.with_conn(move |conn| {
            let task = conn
                .query_row(
                    "SELECT id, name, cron_schedule, action_name, action_function,
                            action_configuration, timeout, next_execution, enabled
                     FROM scheduled_tasks WHERE id = ?1",
                    params![task_id],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
        .await
    }

    /// Insert a task and return its id.
    pub async fn insert_task(&self, task: ScheduledTask) -> Result<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                     (name, cron_schedule, action_name, action_function,
                      action_configuration, timeout, next_execution, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.name,
                    task.cron_schedule,
                    task.action_name,
                    task.action_function,
                    task.action_configuration,
                    task.timeout_ms,
                    task.next_execution.map(|t| t.timestamp()),
                    task.enabled,
                ],
            )
            .context("Failed to insert task")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Apply a partial update. Returns whether the task existed.
    pub async fn patch_task(&self, task_id: i64, patch: TaskPatch) -> Result<bool> {
        self.with_conn(move |conn| {
            let existing = conn
                .query_row(
                    "SELECT id, name, cron_schedule, action_name, action_function,
                            action_configuration, timeout, next_execution, enabled
                     FROM scheduled_tasks WHERE id = ?1",
                    params![task_id],
                    task_from_row,
                )
                .optional()?;
            let Some(mut task) = existing else {
                return Ok(false);
            };

            if let Some(name) = patch.name {
                task.name = name;
            }
            if let Some(cron_schedule) = patch.cron_schedule {
                task.cron_schedule = cron_schedule;
            }
            if let Some(action_name) = patch.action_name {
                task.action_name = action_name;
            }
            if let Some(action_function) = patch.action_function {
                task.action_function = action_function;
            }
            if let Some(configuration) = patch.action_configuration {
                task.action_configuration = configuration;
            }
            if let Some(timeout_ms) = patch.timeout_ms {
                task.timeout_ms = timeout_ms;
            }
            if let Some(next_execution) = patch.next_execution {
                task.next_execution = next_execution;
            }
            if let Some(enabled) = patch.enabled {
                task.enabled = enabled;
            }

            conn.execute(
                "UPDATE scheduled_tasks SET
                     name = ?2, cron_schedule = ?3, action_name = ?4,
                     action_function = ?5, action_configuration = ?6,
                     timeout = ?7, next_execution = ?8, enabled = ?9
                 WHERE id = ?1",
                params![
                    task_id,
                    task.name,
                    task.cron_schedule,
                    task.action_name,
                    task.action_function,
                    task.action_configuration,
                    task.timeout_ms,
                    task.next_execution.map(|t| t.timestamp()),
                    task.enabled,
                ],
            )
            .context("Failed to update task")?;
            Ok(true)
        })
        .await
    }

    /// Delete a task. Returns whether it existed.
    pub async fn delete_task(&self, task_id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let affected = conn
                .execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![task_id])
                .context("Failed to delete task")?;
            Ok(affected > 0)
        })
        .await
    }

    /// Append a run record and return its id.
    pub async fn insert_run(&self, report: TaskRunReport) -> Result<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_runs (task_id, start_time, duration_ms) VALUES (?1, ?2, ?3)",
                params![
                    report.task_id,
                    report.start_time.timestamp(),
                    report.duration_ms
                ],
            )
            .context("Failed to insert task run")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Run history within `[start_time, end_time]` (epoch seconds).
    pub async fn list_runs(&self, start_time: i64, end_time: i64) -> Result<Vec<TaskRun>> {
        self.with_conn(move |conn| {
            let mut statement = conn.prepare(
                "SELECT id, task_id, start_time, duration_ms FROM task_runs
                 WHERE start_time >= ?1 AND start_time <= ?2 ORDER BY start_time",
            )?;
            let runs = statement
                .query_map(params![start_time, end_time], |row| {
                    Ok(TaskRun {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        start_time: epoch_to_utc(row.get(2)?),
                        duration_ms: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
        .await
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let next_execution: Option<i64> = row.get(7)?;
    Ok(ScheduledTask {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        cron_schedule: row.get(2)?,
        action_name: row.get(3)?,
        action_function: row.get(4)?,
        action_configuration: row.get(5)?,
        timeout_ms: row.get(6)?,
        next_execution: next_execution.map(epoch_to_utc),
        enabled: row.get(8)?,
    })
}

fn epoch_to_utc(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_task(name: &str) -> ScheduledTask {
        ScheduledTask {
            id: None,
            name: name.into(),
            cron_schedule: "*/5 * * * *".into(),
            action_name: "Console".into(),
            action_function: "run_console".into(),
            action_configuration: b"echo hi".to_vec(),
            timeout_ms: 5_000,
            next_execution: Some(epoch_to_utc(Utc::now().timestamp())),
            enabled: true,
        }
    }

    async fn temp_repository() -> (tempfile::TempDir, TaskRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repository = TaskRepository::open(dir.path().join("tasks.db"))
            .await
            .unwrap();
        (dir, repository)
    }

    #[tokio::test]
    async fn insert_and_list_round_trips() {
        let (_dir, repository) = temp_repository().await;
        let task = sample_task("demo");
        let id = repository.insert_task(task.clone()).await.unwrap();

        let tasks = repository.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, Some(id));
        assert_eq!(tasks[0].name, "demo");
        assert_eq!(tasks[0].next_execution, task.next_execution);
        assert_eq!(tasks[0].action_configuration, b"echo hi");
    }

    #[tokio::test]
    async fn patch_touches_only_named_fields() {
        let (_dir, repository) = temp_repository().await;
        let id = repository.insert_task(sample_task("demo")).await.unwrap();

        let next = epoch_to_utc(Utc::now().timestamp()) + Duration::minutes(5);
        let patched = repository
            .patch_task(
                id,
                TaskPatch {
                    enabled: Some(false),
                    next_execution: Some(Some(next)),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(patched);

        let task = repository.get_task(id).await.unwrap().unwrap();
        assert!(!task.enabled);
        assert_eq!(task.next_execution, Some(next));
        assert_eq!(task.name, "demo");
    }

    #[tokio::test]
    async fn patch_can_clear_next_execution() {
        let (_dir, repository) = temp_repository().await;
        let id = repository.insert_task(sample_task("demo")).await.unwrap();

        repository
            .patch_task(id, TaskPatch::next_execution(None))
            .await
            .unwrap();
        let task = repository.get_task(id).await.unwrap().unwrap();
        assert!(task.next_execution.is_none());
    }

    #[tokio::test]
    async fn unknown_ids_report_missing() {
        let (_dir, repository) = temp_repository().await;
        assert!(!repository.patch_task(42, TaskPatch::default()).await.unwrap());
        assert!(!repository.delete_task(42).await.unwrap());
        assert!(repository.get_task(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn runs_filter_by_window() {
        let (_dir, repository) = temp_repository().await;
        let id = repository.insert_task(sample_task("demo")).await.unwrap();

        let base = Utc::now().timestamp();
        for offset in [0, 60, 3_600] {
            repository
                .insert_run(TaskRunReport {
                    task_id: id,
                    start_time: epoch_to_utc(base + offset),
                    duration_ms: 12,
                })
                .await
                .unwrap();
        }

        let runs = repository.list_runs(base, base + 120).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| run.task_id == id));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let (_dir, repository) = temp_repository().await;
        repository.insert_task(sample_task("demo")).await.unwrap();
        assert!(repository.insert_task(sample_task("demo")).await.is_err());
    }
}
