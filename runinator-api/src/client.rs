//! The web-service client used by the scheduler, worker and importer.

use std::time::Duration;

use reqwest::{Client, Response, Url};
use runinator_core::{ScheduledTask, TaskAck, TaskPatch, TaskRun, TaskRunReport};

use crate::error::ApiError;
use crate::locator::ServiceLocator;

/// Default deadline for control-plane calls.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Asynchronous client for the web service's task API.
#[derive(Clone)]
pub struct ApiClient<L> {
    client: Client,
    locator: L,
}

impl<L> ApiClient<L>
where
    L: ServiceLocator,
{
    /// Client with the default 30 s control-plane timeout.
    pub fn new(locator: L) -> Result<Self, ApiError> {
        Self::with_timeout(locator, DEFAULT_API_TIMEOUT)
    }

    /// Client with an explicit request timeout (`--api-timeout-seconds`).
    pub fn with_timeout(locator: L, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        Ok(Self { client, locator })
    }

    /// All registered tasks.
    pub async fn fetch_tasks(&self) -> Result<Vec<ScheduledTask>, ApiError> {
        let url = self.build_url("tasks").await?;
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Register a new task; the ack carries the assigned id.
    pub async fn create_task(&self, task: &ScheduledTask) -> Result<TaskAck, ApiError> {
        let url = self.build_url("tasks").await?;
        let response = self.client.post(url).json(task).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Partially update a task.
    pub async fn update_task(&self, task_id: i64, patch: &TaskPatch) -> Result<TaskAck, ApiError> {
        let url = self.build_url(&format!("tasks/{task_id}")).await?;
        let response = self.client.patch(url).json(patch).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Remove a task.
    pub async fn delete_task(&self, task_id: i64) -> Result<TaskAck, ApiError> {
        let url = self.build_url(&format!("tasks/{task_id}")).await?;
        let response = self.client.delete(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Ask for an immediate out-of-schedule firing.
    pub async fn request_run(&self, task_id: i64) -> Result<TaskAck, ApiError> {
        let url = self.build_url(&format!("tasks/{task_id}/request_run")).await?;
        let response = self.client.post(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Record one completed invocation.
    pub async fn log_task_run(&self, report: &TaskRunReport) -> Result<TaskAck, ApiError> {
        let url = self.build_url("task_runs").await?;
        let response = self.client.post(url).json(report).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Run history within an epoch-seconds window.
    pub async fn fetch_task_runs(
        &self,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<TaskRun>, ApiError> {
        let mut url = self.build_url("task_runs").await?;
        url.query_pairs_mut()
            .append_pair("start_time", &start_time.to_string())
            .append_pair("end_time", &end_time.to_string());
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn build_url(&self, path: &str) -> Result<Url, ApiError> {
        let base = self.locator.base_url().await?;
        let base_url = Url::parse(&base).map_err(|err| ApiError::InvalidBaseUrl {
            url: base.clone(),
            message: err.to_string(),
        })?;
        base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::InvalidBaseUrl {
                url: format!("{base}{path}"),
                message: err.to_string(),
            })
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read body>".to_string());
            Err(ApiError::Http {
                status: status.as_u16(),
                message,
            })
        }
    }
}
