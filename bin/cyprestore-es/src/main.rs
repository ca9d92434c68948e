//! CypreStore ExtentServer daemon
//!
//! Runs one storage node. Without a topology service every extent routes to
//! this node with no secondaries.

use anyhow::{Context, Result};
use clap::Parser;
use cyprestore_common::config::Config;
use cyprestore_es::{Collaborators, ExtentServer, NoPeers, StandaloneRouter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cyprestore-es")]
#[command(about = "CypreStore ExtentServer")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cyprestore/es.toml")]
    config: PathBuf,

    /// ExtentServer id
    #[arg(long)]
    es_id: Option<u32>,

    /// Address peers reach this node on
    #[arg(short, long)]
    address: Option<String>,

    /// Device or backing file path
    #[arg(long)]
    device: Option<PathBuf>,

    /// Extent metadata database path
    #[arg(long)]
    meta_path: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the file
    if let Some(id) = args.es_id {
        config.server.es_id = id;
    }
    if let Some(address) = &args.address {
        config.server.address.clone_from(address);
    }
    if let Some(device) = &args.device {
        config.storage.device_path.clone_from(device);
    }
    if let Some(path) = &args.meta_path {
        config.metadata.path.clone_from(path);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting CypreStore ExtentServer");
    info!("Config file: {}", args.config.display());
    info!(
        "Device: {} ({:?}, direct_io={})",
        config.storage.device_path.display(),
        config.storage.device_type,
        config.storage.direct_io
    );

    let admin_interval = Duration::from_millis(config.server.admin_interval_ms.max(1));
    let collaborators = Collaborators {
        router: Arc::new(StandaloneRouter::new(config.server.instance())),
        peers: Arc::new(NoPeers),
    };
    let server = tokio::task::spawn_blocking(move || ExtentServer::start(config, collaborators))
        .await
        .context("startup task")??;
    let server = Arc::new(server);

    let mut ticker = tokio::time::interval(admin_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let server = Arc::clone(&server);
                if let Err(e) = tokio::task::spawn_blocking(move || server.period_admin()).await {
                    warn!("Admin tick failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .context("shutdown task")??;
    info!("ExtentServer stopped");
    Ok(())
}
