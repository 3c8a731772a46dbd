//! scout: self-organizing cluster node.
//!
//! Finds an existing cluster (subnet broadcast or a service directory), joins
//! it or seeds a new one, and keeps the consensus voter set in line with
//! gossip membership until stopped.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scout_daemon::{Config, Node};

#[derive(Parser, Debug)]
#[command(name = "scout")]
#[command(about = "Self-organizing cluster node")]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, env = "SCOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for durable consensus state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// IP to advertise to the cluster
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    /// Node name (defaults to the hostname)
    #[arg(long)]
    node_name: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(ip) = self.advertise_ip {
            config.advertise_ip = Some(ip);
        }
        if let Some(name) = self.node_name {
            config.node_name = Some(name);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,scout_daemon=debug"
    } else {
        "info,scout_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.into_config()?;
    info!("Starting scout");
    info!("Data directory: {:?}", config.data_dir);
    info!("Discovery mode: {:?}", config.discovery.mode);

    let node = Node::start(config).await?;

    info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    node.shutdown().await;
    Ok(())
}
