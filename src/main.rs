//! mcp-negotiator - connect to remote MCP servers of unknown shape
//!
#![doc = "mcp-negotiator"]
#![doc = "Main entry point for the negotiator CLI."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_negotiator::cli::{Cli, Commands, LogFormat};
use mcp_negotiator::commands;
use mcp_negotiator::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose, cli.log_format);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/negotiator.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Connect { target, oauth, .. } => {
            tracing::info!(target = %target, oauth, "Starting negotiation");
            commands::connect::run_connect(config, target, oauth).await
        }
        Commands::Callback { redirect_url } => {
            tracing::info!("Resuming authorization");
            commands::connect::run_callback(config, redirect_url).await
        }
        Commands::Probe { url } => commands::inspect::run_probe(&config, &url).await,
        Commands::Discover { url } => commands::inspect::run_discover(&config, &url).await,
        Commands::Pkce => commands::inspect::run_pkce(),
        Commands::Recent => commands::connect::run_recent(&config),
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default_level = if verbose {
        "mcp_negotiator=debug"
    } else {
        "mcp_negotiator=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
