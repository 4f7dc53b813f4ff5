//! The bounded execution pool: lease, run, report, settle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use runinator_api::{ApiClient, ServiceLocator};
use runinator_broker::{AckStatus, Broker, LeasedFiring};
use runinator_core::TaskRunReport;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::registry::{HandlerOutcome, HandlerRegistry};

/// Default long-poll on an empty queue.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after an empty poll or broker error before retrying.
const IDLE_BACKOFF: Duration = Duration::from_millis(500);
/// Broker-error backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Run reporting is fire-and-forget with these bounded retries.
const REPORT_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Where completed runs are recorded (the web service in production, an
/// in-memory collector in tests).
#[async_trait]
pub trait RunSink: Send + Sync {
    async fn record_run(&self, report: &TaskRunReport) -> anyhow::Result<()>;
}

#[async_trait]
impl<L> RunSink for ApiClient<L>
where
    L: ServiceLocator,
{
    async fn record_run(&self, report: &TaskRunReport) -> anyhow::Result<()> {
        self.log_task_run(report).await?;
        Ok(())
    }
}

/// `size` cooperative slots sharing one broker handle. The broker's lease
/// tokens keep slots (and other workers) from treading on each other.
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    sink: Arc<dyn RunSink>,
    consumer_id: String,
    size: usize,
    poll_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        sink: Arc<dyn RunSink>,
        consumer_id: impl Into<String>,
    ) -> Self {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            broker,
            registry,
            sink,
            consumer_id: consumer_id.into(),
            size,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Override the slot count (`POOL_SIZE`).
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    /// Override the lease long-poll.
    #[must_use]
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Run every slot until shutdown. In-flight firings are nacked for
    /// requeue when the signal arrives mid-execution.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!(slots = self.size, consumer_id = %self.consumer_id, "worker pool started");
        let mut slots = Vec::with_capacity(self.size);
        for slot in 0..self.size {
            let ctx = SlotContext {
                broker: Arc::clone(&self.broker),
                registry: Arc::clone(&self.registry),
                sink: Arc::clone(&self.sink),
                consumer_id: format!("{}/{slot}", self.consumer_id),
                poll_timeout: self.poll_timeout,
            };
            slots.push(tokio::spawn(slot_loop(ctx, shutdown.clone())));
        }
        for slot in slots {
            let _ = slot.await;
        }
        tracing::info!("worker pool stopped");
    }
}

struct SlotContext {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    sink: Arc<dyn RunSink>,
    consumer_id: String,
    poll_timeout: Duration,
}

async fn slot_loop(ctx: SlotContext, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = IDLE_BACKOFF;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let leased = tokio::select! {
            _ = shutdown.changed() => break,
            leased = ctx.broker.lease(&ctx.consumer_id, ctx.poll_timeout) => leased,
        };

        match leased {
            Ok(Some(lease)) => {
                backoff = IDLE_BACKOFF;
                tokio::select! {
                    _ = shutdown.changed() => {
                        requeue_on_shutdown(&ctx, &lease).await;
                        break;
                    }
                    () = process(&ctx, &lease) => {}
                }
            }
            Ok(None) => {
                // Empty queue; the long-poll already absorbed most of the
                // wait.
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(IDLE_BACKOFF) => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "lease failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn process(ctx: &SlotContext, lease: &LeasedFiring) {
    let firing = &lease.firing;

    let Some(handler) = ctx
        .registry
        .resolve(&firing.action_name, &firing.action_function)
    else {
        tracing::error!(
            firing_id = firing.id,
            action = %firing.action_name,
            function = %firing.action_function,
            "no handler registered"
        );
        settle(ctx, lease, false, Some("handler_not_found".into())).await;
        return;
    };

    let timeout = Duration::from_millis(firing.timeout_ms.max(1) as u64);
    let start_time = Utc::now();
    let started = Instant::now();
    let outcome = handler.invoke(&firing.configuration, timeout).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    // Every completed invocation gets a run record, including failures
    // and timeouts.
    report_run(
        ctx,
        TaskRunReport {
            task_id: firing.task_id,
            start_time,
            duration_ms,
        },
    )
    .await;

    match outcome {
        HandlerOutcome::Success { .. } => {
            tracing::info!(
                firing_id = firing.id,
                task_id = firing.task_id,
                duration_ms,
                "task completed"
            );
            match ctx.broker.ack(firing.id, &lease.lease_token).await {
                Ok(AckStatus::Acked) => {}
                Ok(AckStatus::Stale) => {
                    tracing::warn!(firing_id = firing.id, "lease expired before ack");
                }
                Err(err) => {
                    tracing::error!(firing_id = firing.id, error = %err, "ack failed");
                }
            }
        }
        HandlerOutcome::Failure { message, retryable } => {
            tracing::error!(
                firing_id = firing.id,
                task_id = firing.task_id,
                retryable,
                error = %message,
                "handler failed"
            );
            settle(ctx, lease, retryable, Some(message)).await;
        }
        HandlerOutcome::Timeout => {
            tracing::warn!(
                firing_id = firing.id,
                task_id = firing.task_id,
                timeout_ms = firing.timeout_ms,
                "handler timed out"
            );
            settle(ctx, lease, true, Some("timeout".into())).await;
        }
    }
}

/// Nack the firing, requeueing or dropping it.
async fn settle(ctx: &SlotContext, lease: &LeasedFiring, requeue: bool, reason: Option<String>) {
    match ctx
        .broker
        .nack(lease.firing.id, &lease.lease_token, requeue, reason)
        .await
    {
        Ok(AckStatus::Acked) => {}
        Ok(AckStatus::Stale) => {
            tracing::warn!(firing_id = lease.firing.id, "lease expired before nack");
        }
        Err(err) => {
            tracing::error!(firing_id = lease.firing.id, error = %err, "nack failed");
        }
    }
}

async fn requeue_on_shutdown(ctx: &SlotContext, lease: &LeasedFiring) {
    tracing::info!(
        firing_id = lease.firing.id,
        "shutdown mid-execution; returning firing to the queue"
    );
    settle(ctx, lease, true, Some("worker shutdown".into())).await;
}

/// Post the run record with bounded retries; an exhausted retry budget is
/// logged, not fatal.
async fn report_run(ctx: &SlotContext, report: TaskRunReport) {
    let mut delays = REPORT_RETRY_DELAYS.iter();
    loop {
        match ctx.sink.record_run(&report).await {
            Ok(()) => return,
            Err(err) => match delays.next() {
                Some(delay) => {
                    tracing::warn!(task_id = report.task_id, error = %err, "run report failed; retrying");
                    tokio::time::sleep(*delay).await;
                }
                None => {
                    tracing::error!(task_id = report.task_id, error = %err, "run report dropped after retries");
                    return;
                }
            },
        }
    }
}
