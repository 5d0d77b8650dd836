//! Explicit configuration values for the daemons.
//!
//! Configuration is loaded once from a JSON file and passed by value into
//! each component constructor; nothing reads process-wide mutable state.
//! Every field has a default, so a partial file (or none at all) works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::pow::{NoncePolicy, SearchOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Load any config type from a JSON file.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Connection settings for the node's JSON-RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl RpcConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8332,
            user: String::new(),
            password: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Settings for the solo mining daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub rpc: RpcConfig,

    /// Address receiving the block reward; resolved to a script via the
    /// node.
    pub payout_address: String,

    /// Optional tag pushed into the coinbase scriptSig.
    pub coinbase_message: Option<String>,

    /// Rescale the template target by this factor. `None` mines at the
    /// template's real target; only useful off-mainnet.
    pub difficulty_factor: Option<f64>,

    pub nonce_policy: NoncePolicy,

    /// Parallel search workers, each on a disjoint extranonce2 slice.
    pub workers: usize,

    /// Watchdog cadence for best-block polling.
    pub poll_interval_secs: u64,

    /// Header timestamp refresh cadence; 0 disables refreshing.
    pub timestamp_refresh_secs: u64,

    /// Wall-clock cadence of worker status reports.
    pub status_interval_secs: u64,

    /// Fixed process-level extranonce1, hex.
    pub extranonce1: String,

    /// Serialized width of worker extranonce2 values.
    pub extranonce2_size: u8,

    /// Where to persist per-cycle debug records; `None` disables them.
    pub artifacts_dir: Option<PathBuf>,
}

impl MinerConfig {
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            timestamp_refresh: (self.timestamp_refresh_secs > 0)
                .then(|| Duration::from_secs(self.timestamp_refresh_secs)),
            status_interval: Duration::from_secs(self.status_interval_secs.max(1)),
            ..SearchOptions::default()
        }
    }
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            payout_address: String::new(),
            coinbase_message: Some("/ferrite/".to_string()),
            difficulty_factor: None,
            nonce_policy: NoncePolicy::Incremental,
            workers: 1,
            poll_interval_secs: 20,
            timestamp_refresh_secs: 30,
            status_interval_secs: 2,
            extranonce1: "1234567890abcdef".to_string(),
            extranonce2_size: 4,
            artifacts_dir: None,
        }
    }
}

/// Settings for the stratum job server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub rpc: RpcConfig,

    /// Listen address for worker connections.
    pub listen: String,

    pub payout_address: String,
    pub coinbase_message: Option<String>,

    /// Share target rescaling; `None` hands workers the template target.
    pub difficulty_factor: Option<f64>,

    /// Template refresh and job re-issue cadence.
    pub refresh_interval_secs: u64,

    /// Watchdog cadence for best-block polling.
    pub poll_interval_secs: u64,

    /// Extranonce1 used when building the job's split coinbase. Workers
    /// get their own per-connection values of the same width.
    pub extranonce1: String,

    pub extranonce2_size: u8,

    pub artifacts_dir: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            listen: "0.0.0.0:3333".to_string(),
            payout_address: String::new(),
            coinbase_message: Some("/ferrite/".to_string()),
            difficulty_factor: None,
            refresh_interval_secs: 30,
            poll_interval_secs: 20,
            extranonce1: "1234567890abcdef".to_string(),
            extranonce2_size: 4,
            artifacts_dir: None,
        }
    }
}
