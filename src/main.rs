mod cli;
mod config;
mod error;
mod manager;
mod output;
mod protocol;
mod query;
mod reconciler;
mod settle;
mod tree;
mod walker;
mod watcher;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use config::ServiceConfig;
use manager::WatchManager;

fn load_service_config(path: Option<&Path>) -> Result<ServiceConfig> {
    match path {
        Some(path) => ServiceConfig::load(path),
        None => Ok(ServiceConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Find {
            path,
            under,
            format,
            settle_timeout_ms,
            config,
        } => {
            let mut service = load_service_config(config.as_deref())?;
            if let Some(ms) = settle_timeout_ms {
                service.settle_timeout_ms = ms;
            }

            let path = std::path::absolute(&path)
                .with_context(|| format!("invalid path {}", path.display()))?;
            let manager = WatchManager::new(service);
            let handle = manager.watch(&path).await?;
            let result = manager.find(&handle.root, &under).await;
            manager.shutdown().await;
            let listing = result?;

            let stdout = std::io::stdout();
            output::write_listing(&mut stdout.lock(), &handle.root, listing, &format)?;
        }
        Commands::Serve { config } => {
            let manager = WatchManager::new(load_service_config(config.as_deref())?);
            let served = protocol::serve(
                &manager,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await;
            manager.shutdown().await;
            served?;
        }
    }

    Ok(())
}
