//! Stratum job server daemon.
//!
//! Fetches block templates from the configured node, distributes the split
//! coinbase and merkle branch to connected workers, validates their shares,
//! and submits any share that clears the network target as a full block.
//!
//! ```text
//! ferrite-poold [config.json]
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ferrite_miner::config::{self, PoolConfig};
use ferrite_miner::rpc::CoreRpcClient;
use ferrite_miner::stratum::{PoolState, PoolSupervisor, serve};

/// Shares in flight between connection tasks and the supervisor.
const SHARE_QUEUE: usize = 64;

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

    let (share_tx, share_rx) = mpsc::channel(SHARE_QUEUE);
    let state = PoolState::new(config.extranonce2_size, share_tx);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    let server_state = state.clone();
    let server_cancel = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(listener, server_state, server_cancel).await {
            warn!(error = %e, "Stratum server exited");
        }
    });

    PoolSupervisor::new(config, client)
        .run(state, share_rx, shutdown)
        .await
}

/// First CLI argument, then FERRITE_POOL_CONFIG, then built-in defaults.
fn load_config() -> Result<PoolConfig> {
    let path = env::args()
        .nth(1)
        .or_else(|| env::var("FERRITE_POOL_CONFIG").ok())
        .map(PathBuf::from);

    match path {
        Some(path) => config::load(&path).with_context(|| format!("loading {}", path.display())),
        None => Ok(PoolConfig::default()),
    }
}
