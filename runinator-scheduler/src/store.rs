//! Where the scheduler reads tasks and records their advancement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runinator_api::{ApiClient, ServiceLocator};
use runinator_core::{ScheduledTask, TaskPatch};

/// The narrow persistence interface the scheduler consumes.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Enabled tasks whose `next_execution` is at or before `now`.
    async fn due_tasks(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledTask>>;

    /// Persist a task's new cached fire time (`None` parks the task).
    async fn advance(&self, task_id: i64, next: Option<DateTime<Utc>>) -> anyhow::Result<()>;
}

/// Task store backed by the web service's tasks endpoint.
#[derive(Clone)]
pub struct HttpTaskStore<L> {
    client: ApiClient<L>,
}

impl<L> HttpTaskStore<L>
where
    L: ServiceLocator,
{
    #[must_use]
    pub fn new(client: ApiClient<L>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<L> TaskStore for HttpTaskStore<L>
where
    L: ServiceLocator,
{
    async fn due_tasks(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledTask>> {
        let tasks = self.client.fetch_tasks().await?;
        Ok(tasks
            .into_iter()
            .filter(|task| {
                task.enabled
                    && task
                        .next_execution
                        .map(|next| next <= now)
                        .unwrap_or(false)
            })
            .collect())
    }

    async fn advance(&self, task_id: i64, next: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        self.client
            .update_task(task_id, &TaskPatch::next_execution(next))
            .await?;
        Ok(())
    }
}
