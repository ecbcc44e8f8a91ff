mod config;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError};
use rpc::builder::BuildError;
use rpc::clock::{SharedClock, SystemClock};
use shared::admin::run_admin_service;
use shared::metrics::Metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quoter")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the service.
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
    /// Load and validate a config file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Error, Debug)]
enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("metrics init failed: {0}")]
    Metrics(#[from] shared::metrics::MetricError),

    #[error("admin listener failed: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        CliCommand::CheckConfig { config } => match Config::from_file(&config) {
            Ok(_) => println!("config ok"),
            Err(err) => {
                eprintln!("invalid config: {err}");
                std::process::exit(1);
            }
        },
        CliCommand::Serve { config } => {
            if let Err(err) = serve(&config).await {
                tracing::error!(%err, "quoter failed");
                std::process::exit(1);
            }
        }
    }
}

async fn serve(path: &Path) -> Result<(), ServeError> {
    let config = Config::from_file(path)?;

    let metrics = match &config.metrics {
        Some(m) => Metrics::new(&m.statsd_host, m.statsd_port, &m.prefix)?,
        None => Metrics::new_noop(),
    };

    let clock: SharedClock = Arc::new(SystemClock);
    let routers = Arc::new(rpc::builder::build_routers(&config.rpc, metrics, clock)?);
    tracing::info!(chains = routers.len(), "quoter started");

    let is_ready = {
        let routers = routers.clone();
        move || routers.values().any(|r| r.is_ready())
    };
    run_admin_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        is_ready,
    )
    .await?;
    Ok(())
}
