//! Runinator web service entry point.

use std::process::ExitCode;

use clap::Parser;
use runinator_gossip::{
    announce_targets, bind_sender, spawn_announcer, ServiceAnnouncement, ServiceKind,
    DEFAULT_GOSSIP_BIND, DEFAULT_GOSSIP_PORT,
};
use runinator_ws::TaskRepository;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "runinator-ws")]
#[command(about = "Runinator web service - task registry and run history")]
#[command(version)]
struct Args {
    /// Host to bind the API to.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// API port.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// SQLite database path.
    #[arg(long, default_value = "tasks.db")]
    database: String,

    /// Address advertised in gossip announcements.
    #[arg(long, default_value = "127.0.0.1")]
    announce_address: String,

    /// Base path advertised in gossip announcements.
    #[arg(long, default_value = "")]
    announce_base_path: String,

    /// Gossip socket bind address.
    #[arg(long, env = "RUNINATOR_GOSSIP_BIND", default_value = DEFAULT_GOSSIP_BIND)]
    gossip_bind: String,

    /// Gossip UDP port.
    #[arg(long, env = "RUNINATOR_GOSSIP_PORT", default_value_t = DEFAULT_GOSSIP_PORT)]
    gossip_port: u16,

    /// Extra gossip fan-out targets (comma separated host[:port]).
    #[arg(long, value_delimiter = ',')]
    gossip_targets: Vec<String>,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    tracing::info!(
        "Starting Runinator web service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let repository = match TaskRepository::open(&args.database).await {
        Ok(repository) => repository,
        Err(err) => {
            tracing::error!(error = %err, database = %args.database, "failed to open database");
            return ExitCode::from(1);
        }
    };

    let listener = match TcpListener::bind((args.bind.as_str(), args.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind API listener");
            return ExitCode::from(1);
        }
    };
    tracing::info!("Listening on {}:{}", args.bind, args.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    start_gossip(&args, shutdown_rx.clone()).await;

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = runinator_ws::serve(listener, repository, shutdown_rx).await {
        tracing::error!(error = %err, "web service failed");
        return ExitCode::from(2);
    }

    tracing::info!("Web service shut down gracefully");
    ExitCode::SUCCESS
}

/// Announce this service. The web service is a gossip producer only;
/// nothing here consumes other announcements.
async fn start_gossip(args: &Args, shutdown: watch::Receiver<bool>) {
    let announcement = ServiceAnnouncement::new(
        uuid::Uuid::new_v4().to_string(),
        args.announce_address.clone(),
        args.port,
    )
    .with_base_path(&args.announce_base_path);
    let targets = announce_targets(args.gossip_port, args.gossip_targets.iter());

    match bind_sender(&args.gossip_bind).await {
        Ok(sender) => {
            spawn_announcer(sender, ServiceKind::WebService, announcement, targets, shutdown);
        }
        Err(err) => {
            tracing::error!(error = %err, "gossip sender unavailable; running unannounced");
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
