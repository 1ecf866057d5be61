mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr, config, memory_store } => {
            commands::serve::run(&addr, &config, memory_store).await?;
        }
        Commands::Discover { config } => {
            commands::discover::run(&config).await?;
        }
        Commands::List { config } => {
            commands::list::run(&config).await?;
        }
        Commands::Check { config } => {
            commands::check::run(&config).await?;
        }
    }

    Ok(())
}
