//! Burrow binary
//!
//! `burrow broker` runs the public-facing side; `burrow publish` runs next to
//! the hidden services and dials out to a broker.

use anyhow::{Context, Result};
use burrow_broker::{Broker, BrokerConfig};
use burrow_publisher::{PublisherClient, PublisherConfig};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reverse tunnel broker and publisher
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Expose local TCP/UDP services through a public broker", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public-facing broker
    Broker(BrokerArgs),
    /// Publish local services to a broker
    Publish(PublishArgs),
}

#[derive(Args, Debug)]
struct BrokerArgs {
    /// Control WebSocket bind address
    #[arg(long, default_value = "0.0.0.0:11805")]
    control_addr: SocketAddr,

    /// Maximum public ports per publisher
    #[arg(long, default_value = "64")]
    acceptor_limit: usize,

    /// Linger in milliseconds before spliced sockets are destroyed
    #[arg(long, default_value = "500")]
    grace_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Args, Debug)]
struct PublishArgs {
    /// Path to the publisher config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Broker(args) => run_broker(args).await,
        Commands::Publish(args) => run_publish(args).await,
    }
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    init_logging(&args.log_level)?;

    let broker = Broker::new(BrokerConfig {
        control_addr: args.control_addr,
        acceptor_limit: args.acceptor_limit,
        grace: Duration::from_millis(args.grace_ms),
    });
    let addr = broker.listen().await.context("Failed to start broker")?;
    info!("Broker running, control channel on {}", addr);
    info!("Press Ctrl+C to stop");

    wait_for_shutdown().await;

    broker.shutdown();
    info!("Broker stopped");
    Ok(())
}

async fn run_publish(args: PublishArgs) -> Result<()> {
    init_logging(&args.log_level)?;

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = PublisherConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!(
        "Publishing {} service(s) to {}:{}",
        config.services.len(),
        config.host,
        config.port
    );

    let client = PublisherClient::new(config).context("Failed to initialize publisher")?;
    let mut runner = tokio::spawn(Arc::clone(&client).run());

    tokio::select! {
        _ = wait_for_shutdown() => {
            client.stop();
            match runner.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e).context("Publisher failed"),
                Err(e) => error!("Publisher task panicked: {}", e),
            }
        }
        result = &mut runner => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e).context("Publisher failed"),
            Err(e) => error!("Publisher task panicked: {}", e),
        },
    }
    info!("Publisher stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Error listening for shutdown signal: {}", e),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".burrow").join("publisher.json"))
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
