//! Solo mining daemon.
//!
//! Fetches block templates from the configured node, mines them with local
//! search workers, and submits any block it finds. Run with an optional
//! config file path:
//!
//! ```text
//! ferrite-minerd [config.json]
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferrite_miner::config::{self, MinerConfig};
use ferrite_miner::rpc::CoreRpcClient;
use ferrite_miner::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    if config.payout_address.is_empty() {
        bail!("payout_address must be configured");
    }

    let client = Arc::new(CoreRpcClient::new(&config.rpc)?);
    client.check_connection().await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_token.cancel();
        }
    });

    Supervisor::new(config, client).run(shutdown).await
}

/// First CLI argument, then FERRITE_CONFIG, then built-in defaults.
fn load_config() -> Result<MinerConfig> {
    let path = env::args()
        .nth(1)
        .or_else(|| env::var("FERRITE_CONFIG").ok())
        .map(PathBuf::from);

    match path {
        Some(path) => config::load(&path).with_context(|| format!("loading {}", path.display())),
        None => Ok(MinerConfig::default()),
    }
}
