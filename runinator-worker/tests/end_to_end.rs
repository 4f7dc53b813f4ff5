//! End-to-end dispatch pipeline: web service (SQLite) + scheduler +
//! in-memory broker + worker pool, wired exactly as the embedded
//! deployment is.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runinator_api::{ApiClient, FixedLocator};
use runinator_broker::{Broker, FiringQueue};
use runinator_core::{ScheduledTask, TaskRun};
use runinator_scheduler::{HttpTaskStore, Scheduler};
use runinator_worker::{HandlerRegistry, RunSink, WorkerPool};
use runinator_ws::TaskRepository;
use tokio::net::TcpListener;
use tokio::sync::watch;

struct Pipeline {
    base: String,
    client: ApiClient<FixedLocator>,
    queue: FiringQueue,
    shutdown_tx: watch::Sender<bool>,
}

async fn start_pipeline() -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let repository = TaskRepository::open(dir.path().join("tasks.db"))
        .await
        .unwrap();
    std::mem::forget(dir);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            runinator_ws::serve(listener, repository, shutdown_rx)
                .await
                .unwrap();
        });
    }

    let base = format!("http://{addr}/");
    let client = ApiClient::new(FixedLocator::new(base.as_str())).unwrap();

    let queue = FiringQueue::new();
    queue.spawn_sweeper(shutdown_rx.clone());

    // Scheduler against the HTTP task store, ticking fast for the test.
    {
        let store = HttpTaskStore::new(ApiClient::new(FixedLocator::new(base.as_str())).unwrap());
        let broker: Arc<dyn Broker> = Arc::new(queue.clone());
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            Scheduler::new(store, broker)
                .with_tick(Duration::from_millis(100))
                .run(shutdown_rx)
                .await;
        });
    }

    // Worker pool with the stock console handlers reporting over HTTP.
    {
        let broker: Arc<dyn Broker> = Arc::new(queue.clone());
        let registry = Arc::new(HandlerRegistry::with_console_handlers());
        let sink: Arc<dyn RunSink> =
            Arc::new(ApiClient::new(FixedLocator::new(base.as_str())).unwrap());
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            WorkerPool::new(broker, registry, sink, "e2e-worker")
                .with_size(2)
                .with_poll_timeout(Duration::from_millis(100))
                .run(shutdown_rx)
                .await;
        });
    }

    Pipeline {
        base,
        client,
        queue,
        shutdown_tx,
    }
}

impl Pipeline {
    async fn insert_task(&self, task: &ScheduledTask) -> i64 {
        let ack = self.client.create_task(task).await.unwrap();
        assert!(ack.success, "task rejected: {}", ack.message);
        ack.id.unwrap()
    }

    async fn runs_since(&self, since: i64) -> Vec<TaskRun> {
        self.client
            .fetch_task_runs(since, i64::MAX)
            .await
            .unwrap()
    }

    async fn wait_for_runs(&self, since: i64, count: usize, budget: Duration) -> Vec<TaskRun> {
        tokio::time::timeout(budget, async {
            loop {
                let runs = self.runs_since(since).await;
                if runs.len() >= count {
                    return runs;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("pipeline did not record the expected runs in time")
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn console_task(name: &str, command: &str, timeout_ms: i64) -> ScheduledTask {
    ScheduledTask {
        id: None,
        name: name.into(),
        cron_schedule: "*/1 * * * *".into(),
        action_name: "Console".into(),
        action_function: "run_console".into(),
        action_configuration: command.as_bytes().to_vec(),
        timeout_ms,
        // Already due: the scheduler should fire on its first tick.
        next_execution: Some(Utc::now() - chrono::Duration::seconds(1)),
        enabled: true,
    }
}

#[cfg(unix)]
#[tokio::test]
async fn a_due_task_runs_within_seconds() {
    let pipeline = start_pipeline().await;
    let window_start = Utc::now().timestamp() - 60;

    let id = pipeline
        .insert_task(&console_task("echo-hi", "echo hi", 1_000))
        .await;

    let runs = pipeline
        .wait_for_runs(window_start, 1, Duration::from_secs(3))
        .await;
    assert_eq!(runs[0].task_id, id);
    assert!(runs[0].duration_ms < 1_000);

    // The firing was acked: nothing is left in flight.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.queue.in_flight(), 0);

    // And the task advanced onto a future slot instead of re-firing.
    let tasks = pipeline.client.fetch_tasks().await.unwrap();
    assert!(tasks[0].next_execution.unwrap() > Utc::now());
}

#[cfg(unix)]
#[tokio::test]
async fn disabled_tasks_never_fire() {
    let pipeline = start_pipeline().await;
    let window_start = Utc::now().timestamp() - 60;

    let mut task = console_task("disabled", "echo nope", 1_000);
    task.enabled = false;
    pipeline.insert_task(&task).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(pipeline.runs_since(window_start).await.is_empty());
    assert_eq!(pipeline.queue.in_flight(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn a_timed_out_handler_is_recorded_and_requeued() {
    let pipeline = start_pipeline().await;
    let window_start = Utc::now().timestamp() - 60;

    // 1 ms budget against a 1 s sleep: every attempt times out.
    pipeline
        .insert_task(&console_task("too-slow", "sleep 1", 1))
        .await;

    // The first attempt produces a run record and the firing is either
    // requeued for another try or, once attempts run out, dead-lettered.
    let runs = pipeline
        .wait_for_runs(window_start, 1, Duration::from_secs(5))
        .await;
    assert!(!runs.is_empty());
    let dead = pipeline.queue.list_dead().await.unwrap();
    assert!(pipeline.queue.in_flight() >= 1 || !dead.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn base_url_is_normalized() {
    let pipeline = start_pipeline().await;
    assert!(pipeline.base.ends_with('/'));
}
