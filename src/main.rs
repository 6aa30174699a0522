use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use s3gate::breaker::{spawn_reload_task, BreakerConfig, CircuitBreaker, ConfigStore, FileConfigStore, LimitTable};
use s3gate::config::{GatewayConfig, LogFormat, LoggingConfig};

#[derive(Debug, Parser)]
#[command(name = "s3gate", version, about = "In-flight admission control for S3 gateways")]
struct Cli {
    /// Gateway configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decode a circuit breaker document and print the resulting limits
    Validate {
        /// Path to the document
        file: PathBuf,
    },
    /// Load limits from the config store and keep them fresh until shutdown
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    match cli.command {
        Command::Validate { file } => validate(file),
        Command::Watch => watch(config).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn validate(file: PathBuf) -> anyhow::Result<()> {
    let config = BreakerConfig::from_file(&file)
        .with_context(|| format!("invalid circuit breaker config {}", file.display()))?;
    let table = LimitTable::build(&config, 1)?;

    println!("enabled: {}", table.is_enabled());
    for (key, limit) in table.entries() {
        println!("{} = {}", key, limit);
    }
    Ok(())
}

async fn watch(config: GatewayConfig) -> anyhow::Result<()> {
    info!("Starting s3gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::new(&config.breaker.config_path));
    let breaker = Arc::new(CircuitBreaker::initialize(store.as_ref()).await);
    info!(
        store = %store.describe(),
        enabled = breaker.is_enabled(),
        generation = breaker.generation(),
        "Circuit breaker initialized"
    );

    let reload = config
        .breaker
        .reload_interval()
        .map(|interval| spawn_reload_task(Arc::clone(&breaker), Arc::clone(&store), interval));

    shutdown_signal().await;

    if let Some(handle) = reload {
        handle.abort();
    }
    info!("s3gate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
