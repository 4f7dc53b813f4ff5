//! Runinator importer: polls a JSON task file and seeds the web service
//! whenever the file changes.

use std::path::Path;
use std::process::ExitCode;
use std::time::{Duration, SystemTime};

use clap::Parser;
use runinator_api::{ApiClient, ApiError, FixedLocator, GossipLocator, ServiceLocator};
use runinator_core::ScheduledTask;
use runinator_gossip::{
    bind_listener, spawn_listener, ServiceDirectory, DEFAULT_GOSSIP_BIND, DEFAULT_GOSSIP_PORT,
};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "runinator-importer")]
#[command(about = "Runinator importer - seeds tasks from a JSON file")]
#[command(version)]
struct Args {
    /// JSON file with a top-level `tasks` array.
    #[arg(long, default_value = "tasks.json")]
    tasks_file: String,

    /// Seconds between file checks.
    #[arg(long, default_value_t = 30)]
    poll_interval_seconds: u64,

    /// Pin the web service base URL instead of following gossip.
    #[arg(long)]
    api_base_url: Option<String>,

    /// Deadline for web service calls, in seconds.
    #[arg(long, default_value_t = 30)]
    api_timeout_seconds: u64,

    /// Gossip listener bind address.
    #[arg(long, env = "RUNINATOR_GOSSIP_BIND", default_value = DEFAULT_GOSSIP_BIND)]
    gossip_bind: String,

    /// Gossip UDP port.
    #[arg(long, env = "RUNINATOR_GOSSIP_PORT", default_value_t = DEFAULT_GOSSIP_PORT)]
    gossip_port: u16,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

/// Shape of the seed file.
#[derive(Debug, Deserialize)]
struct TaskFile {
    tasks: Vec<ScheduledTask>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    tracing::info!("Starting Runinator importer v{}", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let directory = ServiceDirectory::new();
    if args.api_base_url.is_none() {
        match bind_listener(&args.gossip_bind, args.gossip_port).await {
            Ok(listener) => {
                spawn_listener(listener, directory.clone(), shutdown_rx.clone());
            }
            Err(err) => {
                tracing::error!(error = %err, "gossip listener unavailable and no --api-base-url");
                return ExitCode::from(1);
            }
        }
    }
    drop(shutdown_rx);

    let api_timeout = Duration::from_secs(args.api_timeout_seconds.max(1));
    let code = match args.api_base_url.as_deref() {
        Some(base) => {
            let client = ApiClient::with_timeout(FixedLocator::new(base), api_timeout);
            run_loop(&args, client).await
        }
        None => {
            let client = ApiClient::with_timeout(GossipLocator::new(directory), api_timeout);
            run_loop(&args, client).await
        }
    };

    let _ = shutdown_tx.send(true);
    code
}

async fn run_loop<L>(args: &Args, client: Result<ApiClient<L>, ApiError>) -> ExitCode
where
    L: ServiceLocator,
{
    let client = match client {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build API client");
            return ExitCode::from(1);
        }
    };

    let mut interval = time::interval(Duration::from_secs(args.poll_interval_seconds.max(1)));
    let mut last_modified: Option<SystemTime> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = sync_if_changed(&args.tasks_file, &client, &mut last_modified).await {
                    tracing::error!(error = %err, "failed to synchronize tasks");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, exiting importer");
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

/// Re-seed only when the file's mtime moved forward.
async fn sync_if_changed<L>(
    tasks_file: &str,
    client: &ApiClient<L>,
    last_modified: &mut Option<SystemTime>,
) -> anyhow::Result<()>
where
    L: ServiceLocator,
{
    let path = Path::new(tasks_file);
    let metadata = tokio::fs::metadata(path).await?;
    let modified = metadata.modified()?;
    if last_modified.map_or(false, |previous| modified <= previous) {
        return Ok(());
    }

    let data = tokio::fs::read_to_string(path).await?;
    let parsed: TaskFile = serde_json::from_str(&data)?;
    tracing::info!(count = parsed.tasks.len(), file = %path.display(), "seeding tasks");

    for task in parsed.tasks {
        if let Err(err) = task.validate() {
            tracing::warn!(task = %task.name, error = %err, "skipping invalid task");
            continue;
        }
        let ack = client.create_task(&task).await?;
        if !ack.success {
            tracing::warn!(task = %task.name, message = %ack.message, "task not accepted");
        }
    }

    *last_modified = Some(modified);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_file_parses() {
        let data = r#"{
            "tasks": [{
                "name": "hello",
                "cron_schedule": "*/5 * * * *",
                "action_name": "Console",
                "action_function": "run_console",
                "action_configuration": [101, 99, 104, 111],
                "timeout_ms": 1000
            }]
        }"#;
        let parsed: TaskFile = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.tasks.len(), 1);
        assert_eq!(parsed.tasks[0].name, "hello");
        assert!(parsed.tasks[0].enabled);
        assert!(parsed.tasks[0].validate().is_ok());
    }
}
