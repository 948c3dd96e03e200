//! agentmesh coordinator entry point

use agentmesh::config::CoordinatorConfig;
use agentmesh::observability::init_default_logging;
use agentmesh::protocol::all_payload_schemas;
use agentmesh::Coordinator;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info};

/// Three-layer agent coordination service
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(about = "Coordinates tool invocation, agent messaging and workflows")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AGENTMESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Print the JSON Schemas for every message payload
    Schema,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    if let Commands::Schema = cli.command {
        match serde_json::to_string_pretty(&all_payload_schemas()) {
            Ok(schemas) => println!("{schemas}"),
            Err(e) => {
                error!("Failed to render schemas: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    info!("Starting agentmesh v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_coordinator(config).await,
        Commands::Config { show } => handle_config_command(config, show),
        Commands::Schema => Ok(()),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<CoordinatorConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(CoordinatorConfig::load_from_file(path)?);
    }

    for candidate in ["agentmesh.toml", "config/agentmesh.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(CoordinatorConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create agentmesh.toml".into())
}

async fn run_coordinator(config: CoordinatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Coordinator ID: {}", config.coordinator.id);

    let mut coordinator = Coordinator::builder(config).build().await?;
    coordinator.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    coordinator.shutdown().await?;
    Ok(())
}

fn handle_config_command(
    config: CoordinatorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}
