//! Node RPC contract and its JSON-RPC 1.0 client.
//!
//! The node is the authority on template contents and block acceptance;
//! everything here is treated as slow and fallible. Callers retry transient
//! failures through [`ExponentialBackoff`]; an RPC error is never fatal to
//! the process, it just delays the next cycle.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::config::RpcConfig;
use crate::template::BlockTemplate;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node rejected {method}: {message}")]
    Node { method: String, message: String },

    #[error("unexpected response shape for {method}")]
    Shape { method: String },
}

/// Outcome of `submitblock`: the node answers null on acceptance and a
/// reason string on rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Rejected(String),
}

/// The node operations this crate consumes.
///
/// Abstract so the supervisor and pool can run against a test double; the
/// production implementation is [`CoreRpcClient`].
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// `getblocktemplate` with segwit rules.
    async fn fetch_template(&self) -> Result<BlockTemplate, RpcError>;

    /// `getbestblockhash`, polled by the watchdog.
    async fn best_block_hash(&self) -> Result<String, RpcError>;

    /// Resolve a payout address to its scriptPubKey bytes.
    async fn resolve_payout_script(&self, address: &str) -> Result<Vec<u8>, RpcError>;

    /// Full wire bytes of a transaction, used to backfill template entries
    /// the node delivered without `data`.
    async fn fetch_full_transaction(&self, txid: &str) -> Result<Vec<u8>, RpcError>;

    /// Submit a serialized block.
    async fn submit_block(&self, block_hex: &str) -> Result<SubmitResult, RpcError>;
}

/// JSON-RPC 1.0 client for Bitcoin Core and compatible nodes.
pub struct CoreRpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl CoreRpcClient {
    pub fn new(config: &RpcConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            url: config.url(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = json!({
            "jsonrpc": "1.0",
            "id": "ferrite",
            "method": method,
            "params": params,
        });

        let response: Value = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;

        let error = &response["error"];
        if !error.is_null() {
            let message = error["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(RpcError::Node {
                method: method.to_string(),
                message,
            });
        }

        Ok(response["result"].clone())
    }

    /// Verify the node is reachable and log where we landed.
    pub async fn check_connection(&self) -> Result<(), RpcError> {
        let info = self.call("getblockchaininfo", json!([])).await?;
        info!(
            chain = info["chain"].as_str().unwrap_or("?"),
            blocks = info["blocks"].as_u64().unwrap_or(0),
            difficulty = info["difficulty"].as_f64().unwrap_or(0.0),
            "Node connection verified"
        );
        Ok(())
    }
}

#[async_trait]
impl NodeClient for CoreRpcClient {
    async fn fetch_template(&self) -> Result<BlockTemplate, RpcError> {
        let result = self
            .call("getblocktemplate", json!([{ "rules": ["segwit"] }]))
            .await?;
        serde_json::from_value(result).map_err(|_| RpcError::Shape {
            method: "getblocktemplate".to_string(),
        })
    }

    async fn best_block_hash(&self) -> Result<String, RpcError> {
        self.call("getbestblockhash", json!([]))
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or(RpcError::Shape {
                method: "getbestblockhash".to_string(),
            })
    }

    async fn resolve_payout_script(&self, address: &str) -> Result<Vec<u8>, RpcError> {
        let info = self.call("getaddressinfo", json!([address])).await?;
        let script_hex = info["scriptPubKey"].as_str().ok_or(RpcError::Shape {
            method: "getaddressinfo".to_string(),
        })?;
        hex::decode(script_hex).map_err(|_| RpcError::Shape {
            method: "getaddressinfo".to_string(),
        })
    }

    async fn fetch_full_transaction(&self, txid: &str) -> Result<Vec<u8>, RpcError> {
        let raw = self.call("getrawtransaction", json!([txid])).await?;
        let raw_hex = raw.as_str().ok_or(RpcError::Shape {
            method: "getrawtransaction".to_string(),
        })?;
        hex::decode(raw_hex).map_err(|_| RpcError::Shape {
            method: "getrawtransaction".to_string(),
        })
    }

    async fn submit_block(&self, block_hex: &str) -> Result<SubmitResult, RpcError> {
        let result = self.call("submitblock", json!([block_hex])).await?;
        match result {
            Value::Null => Ok(SubmitResult::Accepted),
            Value::String(reason) => Ok(SubmitResult::Rejected(reason)),
            other => Ok(SubmitResult::Rejected(other.to_string())),
        }
    }
}

/// Exponential backoff for retry timing.
///
/// Starts at `initial` and doubles after each call to `next_delay()`,
/// capping at `max`. Each returned delay is jittered to [0.5, 1.0) of the
/// nominal value so a fleet of miners does not hammer the node in lockstep
/// after an outage.
pub struct ExponentialBackoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    // Per-process jitter seed; RandomState is seeded from OS randomness at
    // construction, so different processes spread out even when retrying at
    // the same wall-clock instant.
    jitter_state: RandomState,
    jitter_step: u64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
            jitter_state: RandomState::new(),
            jitter_step: 0,
        }
    }

    /// Return the next backoff delay (with jitter) and advance the state.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.current = (self.current * 2).min(self.max);

        let mut hasher = self.jitter_state.build_hasher();
        hasher.write_u64(self.jitter_step);
        self.jitter_step = self.jitter_step.wrapping_add(1);
        let jitter = 0.5 + (hasher.finish() as f64 / u64::MAX as f64) * 0.5;

        nominal.mul_f64(jitter)
    }

    /// Reset backoff to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
