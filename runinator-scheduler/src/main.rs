//! Runinator scheduler entry point.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use runinator_api::{ApiClient, FixedLocator, GossipLocator, ServiceLocator};
use runinator_broker::{http::HttpBroker, Broker, FiringQueue};
use runinator_gossip::{
    announce_targets, bind_listener, bind_sender, spawn_announcer, spawn_listener,
    ServiceAnnouncement, ServiceDirectory, ServiceKind, DEFAULT_GOSSIP_BIND, DEFAULT_GOSSIP_PORT,
};
use runinator_scheduler::{HttpTaskStore, Scheduler};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BrokerBackend {
    /// Talk to a broker service over HTTP.
    Http,
    /// Self-contained queue inside this process (development mode).
    InMemory,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "runinator-scheduler")]
#[command(about = "Runinator scheduler - publishes due task firings")]
#[command(version)]
struct Args {
    /// Broker transport binding.
    #[arg(long, value_enum, default_value = "http")]
    broker_backend: BrokerBackend,

    /// Broker endpoint for the HTTP backend.
    #[arg(long, default_value = "http://127.0.0.1:7070/")]
    broker_endpoint: String,

    /// Pin the web service base URL instead of following gossip.
    #[arg(long)]
    api_base_url: Option<String>,

    /// Deadline for web service calls, in seconds.
    #[arg(long, default_value_t = 30)]
    api_timeout_seconds: u64,

    /// Seconds between scheduler ticks.
    #[arg(long, default_value_t = 1)]
    poll_interval_seconds: u64,

    /// Gossip listener bind address.
    #[arg(long, env = "RUNINATOR_GOSSIP_BIND", default_value = DEFAULT_GOSSIP_BIND)]
    gossip_bind: String,

    /// Gossip UDP port.
    #[arg(long, env = "RUNINATOR_GOSSIP_PORT", default_value_t = DEFAULT_GOSSIP_PORT)]
    gossip_port: u16,

    /// Extra gossip fan-out targets (comma separated host[:port]).
    #[arg(long, value_delimiter = ',')]
    gossip_targets: Vec<String>,

    /// Address advertised in gossip announcements.
    #[arg(long, default_value = "127.0.0.1")]
    announce_address: String,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    tracing::info!(
        "Starting Runinator scheduler v{}",
        env!("CARGO_PKG_VERSION")
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let directory = ServiceDirectory::new();
    start_gossip(&args, directory.clone(), shutdown_rx.clone()).await;

    let broker: Arc<dyn Broker> = match args.broker_backend {
        BrokerBackend::Http => match HttpBroker::new(&args.broker_endpoint) {
            Ok(broker) => Arc::new(broker),
            Err(err) => {
                tracing::error!(error = %err, "invalid broker endpoint");
                return ExitCode::from(1);
            }
        },
        BrokerBackend::InMemory => {
            tracing::warn!("in-memory broker: firings only exist inside this process");
            let queue = FiringQueue::new();
            queue.spawn_sweeper(shutdown_rx.clone());
            Arc::new(queue)
        }
    };

    let api_timeout = Duration::from_secs(args.api_timeout_seconds.max(1));
    let tick = Duration::from_secs(args.poll_interval_seconds.max(1));

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    match args.api_base_url.as_deref() {
        Some(base) => {
            run_with_locator(FixedLocator::new(base), api_timeout, broker, tick, shutdown_rx).await
        }
        None => {
            run_with_locator(
                GossipLocator::new(directory),
                api_timeout,
                broker,
                tick,
                shutdown_rx,
            )
            .await
        }
    }
}

async fn run_with_locator<L>(
    locator: L,
    api_timeout: Duration,
    broker: Arc<dyn Broker>,
    tick: Duration,
    shutdown: watch::Receiver<bool>,
) -> ExitCode
where
    L: ServiceLocator + 'static,
{
    let client = match ApiClient::with_timeout(locator, api_timeout) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build API client");
            return ExitCode::from(1);
        }
    };

    let scheduler = Scheduler::new(HttpTaskStore::new(client), broker).with_tick(tick);
    scheduler.run(shutdown).await;
    tracing::info!("Scheduler shut down gracefully");
    ExitCode::SUCCESS
}

async fn start_gossip(args: &Args, directory: ServiceDirectory, shutdown: watch::Receiver<bool>) {
    let announcement = ServiceAnnouncement::new(
        uuid::Uuid::new_v4().to_string(),
        args.announce_address.clone(),
        0, // the scheduler exposes no inbound port
    );
    let targets = announce_targets(args.gossip_port, args.gossip_targets.iter());

    match bind_sender(&args.gossip_bind).await {
        Ok(sender) => {
            spawn_announcer(
                sender,
                ServiceKind::Scheduler,
                announcement,
                targets,
                shutdown.clone(),
            );
        }
        Err(err) => {
            tracing::error!(error = %err, "gossip sender unavailable; running unannounced");
        }
    }

    match bind_listener(&args.gossip_bind, args.gossip_port).await {
        Ok(listener) => {
            spawn_listener(listener, directory, shutdown);
        }
        Err(err) => {
            tracing::error!(error = %err, "gossip listener unavailable; relying on --api-base-url");
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
