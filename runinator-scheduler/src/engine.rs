//! The tick loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runinator_broker::Broker;
use runinator_core::{CronExpression, Firing, ScheduledTask};
use tokio::sync::watch;

use crate::store::TaskStore;

/// Cadence of the scheduler loop.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(1);
/// Per-iteration error backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Bound on the catch-up walk through missed slots.
const CATCH_UP_WALK_CAP: usize = 10_000;

/// Publishes due firings and advances tasks onto their next slot.
pub struct Scheduler<S> {
    store: S,
    broker: Arc<dyn Broker>,
    tick: Duration,
}

impl<S> Scheduler<S>
where
    S: TaskStore,
{
    pub fn new(store: S, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            tick: SCHEDULER_TICK,
        }
    }

    /// Override the tick cadence. Tests shrink it.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run until shutdown. A failed iteration never exits the loop; it
    /// logs, backs off exponentially (capped at 30 s), and retries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        let mut backoff = self.tick;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(published) => {
                            backoff = self.tick;
                            if published > 0 {
                                tracing::debug!(published, "tick published firings");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "tick failed");
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// One tick: publish every due task in ascending fire-time order.
    /// Returns the number of firings published (duplicates included).
    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut due = self.store.due_tasks(now).await?;
        due.sort_by_key(|task| task.next_execution);

        let mut published = 0;
        for task in due {
            match self.fire_task(&task, now).await {
                Ok(fired) => published += usize::from(fired),
                Err(err) => {
                    // Leave next_execution untouched; the next tick retries.
                    tracing::warn!(task = %task.name, error = %err, "failed to publish firing");
                }
            }
        }
        Ok(published)
    }

    async fn fire_task(&self, task: &ScheduledTask, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let Some(task_id) = task.id else {
            anyhow::bail!("task `{}` has no id", task.name);
        };
        let cron = match CronExpression::parse(&task.cron_schedule) {
            Ok(cron) => cron,
            Err(err) => {
                // Nothing to fire until the task row is repaired.
                tracing::warn!(task = %task.name, error = %err, "unparseable schedule; skipping");
                return Ok(false);
            }
        };
        let Some(stored) = task.next_execution else {
            // Not yet scheduled: place the task on its grid without firing.
            self.store.advance(task_id, cron.next_after(now)).await?;
            return Ok(false);
        };

        let (slot, next) = catch_up(&cron, stored, now);
        let firing = Firing::for_task(task, slot)
            .ok_or_else(|| anyhow::anyhow!("task `{}` has no id", task.name))?;

        let receipt = self
            .broker
            .publish(firing)
            .await
            .map_err(|err| anyhow::anyhow!("publish: {err}"))?;
        if receipt.duplicate {
            tracing::debug!(task = %task.name, firing_id = receipt.id, "slot already queued");
        }

        if next.is_none() {
            tracing::warn!(task = %task.name, "schedule has no future occurrence; parking task");
        }
        self.store.advance(task_id, next).await?;
        Ok(true)
    }
}

/// Resolve the slot to fire and the slot to advance to.
///
/// When the stored fire time is long past (service outage), fire once for
/// the most recent slot at or before `now` and move on — missed slots are
/// never backfilled. The walk is bounded so a pathological gap cannot
/// stall the tick.
fn catch_up(
    cron: &CronExpression,
    stored: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
    let mut slot = stored;
    for _ in 0..CATCH_UP_WALK_CAP {
        match cron.next_after(slot) {
            Some(next) if next <= now => slot = next,
            later => return (slot, later),
        }
    }
    (slot, cron.next_after(now))
}
