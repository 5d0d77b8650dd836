//! Solo mining cycle supervision.
//!
//! One cycle: fetch a template, build one coinbase per worker (disjoint
//! extranonce2 slices), run the searches on blocking threads, and either
//! submit the found block or restart when the chain tip moves. Workers
//! report progress and terminal events over a typed channel; the aggregator
//! here is the only writer of consolidated totals and treats missing
//! messages as "still running". A watchdog polls the best block hash and
//! raises one cooperative cancellation token observed by the searches.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactStore, ShareRecord};
use crate::coinbase::{Coinbase, CoinbaseBuilder};
use crate::config::MinerConfig;
use crate::encode::hash_from_hex;
use crate::header::{BlockHeader, serialize_block};
use crate::job::Share;
use crate::merkle::merkle_root;
use crate::pow::{self, SearchOutcome, Solution};
use crate::rpc::{ExponentialBackoff, NodeClient, SubmitResult};
use crate::target::{Difficulty, Target};
use crate::template::BlockTemplate;
use crate::types::{Extranonce1, Extranonce2, Extranonce2Range, HashRate};

/// Attempts at submitting a found block before giving up on transport
/// errors. Node-side rejection is final and never retried.
const SUBMIT_ATTEMPTS: usize = 3;

/// Events workers send to the aggregator. Structured data never travels
/// through log lines.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Periodic progress report.
    Status {
        worker: usize,
        attempts: u64,
        hashrate: HashRate,
    },

    /// A worker's search completed with a valid header.
    Found { worker: usize, solution: Solution },

    /// A worker's search observed the cancellation signal.
    Cancelled { worker: usize },
}

/// How a cycle ended. Cancellation is not completion: a superseded cycle
/// carries no header and triggers a plain restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A block was found and handed to the node.
    BlockFound { accepted: bool },

    /// The chain tip moved (or shutdown was requested) before any worker
    /// finished.
    Superseded,
}

/// Poll the best block hash; on change, raise the cancellation token.
///
/// In-flight RPC calls are never aborted, only not retried; a polling error
/// is treated as "no change" and the next tick tries again.
pub async fn watchdog<C: NodeClient>(
    client: Arc<C>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut last = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }

        match client.best_block_hash().await {
            Ok(hash) => {
                if let Some(previous) = &last {
                    if *previous != hash {
                        info!(best = %hash, "New best block observed, cancelling search");
                        cancel.cancel();
                        return;
                    }
                }
                last = Some(hash);
            }
            Err(e) => debug!(error = %e, "Best-block poll failed"),
        }
    }
}

/// Per-worker artifacts built up-front so the found path can serialize the
/// exact block the worker was hashing.
struct WorkerPlan {
    coinbase: Coinbase,
    header: BlockHeader,
    extranonce2: Extranonce2,
}

pub struct Supervisor<C> {
    config: MinerConfig,
    client: Arc<C>,
    artifacts: ArtifactStore,
}

impl<C: NodeClient + 'static> Supervisor<C> {
    pub fn new(config: MinerConfig, client: Arc<C>) -> Self {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        Self {
            config,
            client,
            artifacts,
        }
    }

    /// Mine cycles until shutdown. Transient failures back off and retry;
    /// they never end the process.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut cycle: u64 = 0;

        while !shutdown.is_cancelled() {
            cycle += 1;
            info!(cycle, "Starting mining cycle");

            match self.run_cycle(cycle, &shutdown).await {
                Ok(outcome) => {
                    backoff.reset();
                    match outcome {
                        CycleOutcome::BlockFound { accepted } => {
                            info!(cycle, accepted, "Cycle finished with a block")
                        }
                        CycleOutcome::Superseded => {
                            info!(cycle, "Cycle superseded, refetching template")
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(cycle, error = %e, ?delay, "Cycle failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_cycle(&self, cycle: u64, shutdown: &CancellationToken) -> Result<CycleOutcome> {
        let mut template = self.client.fetch_template().await?;
        let (legacy, segwit) = template.tx_breakdown();
        info!(
            height = template.height,
            transactions = template.transactions.len(),
            legacy,
            segwit,
            "Template fetched"
        );
        self.artifacts.record_template(cycle, &template);

        let payout_script = self
            .client
            .resolve_payout_script(&self.config.payout_address)
            .await
            .context("resolving payout address")?;

        let bits = template.bits_u32().context("template bits")?;
        let target = match self.config.difficulty_factor {
            Some(factor) => Target::from_difficulty_factor(factor)?,
            None => Target::from_compact(bits),
        };
        debug!(%target, difficulty = %Difficulty::of(&target), "Search target resolved");

        let extranonce1 = Extranonce1::from_hex(&self.config.extranonce1)?;
        let workers = self.config.workers.max(1);
        let ranges = Extranonce2Range::new(self.config.extranonce2_size)?
            .split(workers)
            .ok_or_else(|| anyhow!("cannot split extranonce2 space across {workers} workers"))?;

        let plans = self.plan_workers(&template, &payout_script, &extranonce1, &ranges, bits)?;

        // One token per cycle: raised by the watchdog, by shutdown, or by
        // the first worker to finish.
        let cancel = shutdown.child_token();
        let watchdog_task = tokio::spawn(watchdog(
            self.client.clone(),
            Duration::from_secs(self.config.poll_interval_secs.max(1)),
            cancel.clone(),
        ));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut searches = JoinSet::new();
        for (worker, plan) in plans.iter().enumerate() {
            let header = plan.header;
            let policy = self.config.nonce_policy;
            let options = self.config.search_options();
            let cancel = cancel.clone();
            let event_tx = event_tx.clone();

            searches.spawn_blocking(move || {
                let status_tx = event_tx.clone();
                let outcome = pow::search(header, target, policy, &options, &cancel, |status| {
                    let _ = status_tx.send(WorkerEvent::Status {
                        worker,
                        attempts: status.attempts,
                        hashrate: status.hashrate,
                    });
                });

                let _ = event_tx.send(match outcome {
                    SearchOutcome::Found(solution) => WorkerEvent::Found { worker, solution },
                    SearchOutcome::Cancelled => WorkerEvent::Cancelled { worker },
                });
            });
        }
        drop(event_tx);

        let found = self.aggregate(workers, event_rx).await;

        // Whatever happened, wind the cycle down before acting on it.
        cancel.cancel();
        watchdog_task.abort();
        while searches.join_next().await.is_some() {}

        let Some((worker, solution)) = found else {
            return Ok(CycleOutcome::Superseded);
        };

        self.backfill_transactions(&mut template).await?;
        let accepted = self
            .submit(cycle, &mut template, &plans[worker], worker, &solution)
            .await?;
        Ok(CycleOutcome::BlockFound { accepted })
    }

    /// Build the per-worker coinbase and header, each over a disjoint
    /// extranonce2 slice.
    fn plan_workers(
        &self,
        template: &BlockTemplate,
        payout_script: &[u8],
        extranonce1: &Extranonce1,
        ranges: &[Extranonce2Range],
        bits: u32,
    ) -> Result<Vec<WorkerPlan>> {
        let prev_hash = hash_from_hex(&template.previous_block_hash)
            .map_err(|_| anyhow!("bad previous block hash in template"))?;

        let mut tx_leaves = Vec::with_capacity(template.transactions.len());
        for tx in &template.transactions {
            tx_leaves.push(
                hash_from_hex(&tx.txid).map_err(|_| anyhow!("bad txid in template: {}", tx.txid))?,
            );
        }

        let mut plans = Vec::with_capacity(ranges.len());
        for range in ranges {
            let extranonce2 = range.current();
            let coinbase = CoinbaseBuilder::new(
                template,
                payout_script.to_vec(),
                extranonce1.clone(),
                extranonce2,
            )
            .with_message(self.config.coinbase_message.clone())
            .build()?;

            let mut leaves = Vec::with_capacity(tx_leaves.len() + 1);
            leaves.push(coinbase.txid);
            leaves.extend_from_slice(&tx_leaves);

            plans.push(WorkerPlan {
                header: BlockHeader {
                    version: template.version,
                    prev_hash,
                    merkle_root: merkle_root(&leaves),
                    time: template.current_time,
                    bits,
                    nonce: 0,
                },
                coinbase,
                extranonce2,
            });
        }

        Ok(plans)
    }

    /// Consume worker events until the first solution or until every worker
    /// reports cancellation.
    ///
    /// Out-of-order or missing status messages are fine; a worker with no
    /// recent report just keeps its last known totals.
    async fn aggregate(
        &self,
        workers: usize,
        mut event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Option<(usize, Solution)> {
        let mut rates = vec![HashRate::default(); workers];
        let mut attempts = vec![0u64; workers];
        let mut finished = 0usize;
        let mut report = tokio::time::interval(Duration::from_secs(
            self.config.status_interval_secs.max(1) * 2,
        ));
        report.tick().await; // the first tick is immediate and uninteresting

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(WorkerEvent::Status { worker, attempts: a, hashrate }) => {
                            rates[worker] = hashrate;
                            attempts[worker] = a;
                        }
                        Some(WorkerEvent::Found { worker, solution }) => {
                            info!(
                                worker,
                                nonce = format!("{:#010x}", solution.nonce),
                                attempts = solution.attempts,
                                hashrate = %solution.hashrate,
                                hash = %hex::encode(solution.hash),
                                "Worker found a block"
                            );
                            return Some((worker, solution));
                        }
                        Some(WorkerEvent::Cancelled { worker }) => {
                            debug!(worker, "Worker cancelled");
                            finished += 1;
                            if finished == workers {
                                return None;
                            }
                        }
                        // All senders gone without a solution.
                        None => return None,
                    }
                }

                _ = report.tick() => {
                    let total: HashRate = rates.iter().copied().sum();
                    info!(
                        hashrate = %total,
                        attempts = attempts.iter().sum::<u64>(),
                        workers,
                        "Mining status"
                    );
                }
            }
        }
    }

    /// Fill in wire bytes the template omitted, via `getrawtransaction`.
    async fn backfill_transactions(&self, template: &mut BlockTemplate) -> Result<()> {
        for tx in &mut template.transactions {
            if tx.data.is_empty() {
                debug!(txid = %tx.txid, "Backfilling transaction bytes");
                let bytes = self.client.fetch_full_transaction(&tx.txid).await?;
                tx.data = hex::encode(bytes);
            }
        }
        Ok(())
    }

    async fn submit(
        &self,
        cycle: u64,
        template: &mut BlockTemplate,
        plan: &WorkerPlan,
        worker: usize,
        solution: &Solution,
    ) -> Result<bool> {
        let block = serialize_block(&solution.header, &plan.coinbase.bytes, &template.transactions)?;
        let block_hex = hex::encode(block);

        let share = Share {
            worker: format!("worker{worker}"),
            job_id: format!("{cycle:08x}"),
            extranonce2: plan.extranonce2,
            time: solution.header.time,
            nonce: solution.nonce,
        };

        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self.client.submit_block(&block_hex).await {
                Ok(SubmitResult::Accepted) => {
                    info!(hash = %hex::encode(solution.hash), "Block accepted by node");
                    self.artifacts
                        .record_share(cycle, &ShareRecord::new(&share, &solution.hash, true));
                    return Ok(true);
                }
                Ok(SubmitResult::Rejected(reason)) => {
                    // The node made a ruling; retrying the same bytes is
                    // pointless.
                    warn!(%reason, "Block rejected by node");
                    self.artifacts
                        .record_share(cycle, &ShareRecord::new(&share, &solution.hash, false));
                    return Ok(false);
                }
                Err(e) if attempt < SUBMIT_ATTEMPTS => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, attempt, ?delay, "Submit failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        unreachable!("submit loop returns on every branch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcError;
    use crate::template::TemplateTx;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockNode {
        template: BlockTemplate,
        best_hashes: Vec<String>,
        poll_count: AtomicUsize,
        submitted: Mutex<Vec<String>>,
        backfilled: Mutex<Vec<String>>,
    }

    impl MockNode {
        fn new(template: BlockTemplate, best_hashes: Vec<String>) -> Self {
            Self {
                template,
                best_hashes,
                poll_count: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
                backfilled: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NodeClient for MockNode {
        async fn fetch_template(&self) -> Result<BlockTemplate, RpcError> {
            Ok(self.template.clone())
        }

        async fn best_block_hash(&self) -> Result<String, RpcError> {
            let i = self.poll_count.fetch_add(1, Ordering::SeqCst);
            Ok(self.best_hashes[i.min(self.best_hashes.len() - 1)].clone())
        }

        async fn resolve_payout_script(&self, _address: &str) -> Result<Vec<u8>, RpcError> {
            Ok(hex::decode("0014841b80d2cc75f5345c482af96294d04fdd66b2b7").unwrap())
        }

        async fn fetch_full_transaction(&self, txid: &str) -> Result<Vec<u8>, RpcError> {
            self.backfilled.lock().unwrap().push(txid.to_string());
            Ok(vec![0xbe, 0xef])
        }

        async fn submit_block(&self, block_hex: &str) -> Result<SubmitResult, RpcError> {
            self.submitted.lock().unwrap().push(block_hex.to_string());
            Ok(SubmitResult::Accepted)
        }
    }

    fn template() -> BlockTemplate {
        BlockTemplate {
            version: 0x2000_0000,
            height: 1000,
            previous_block_hash:
                "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054".to_string(),
            bits: "207fffff".to_string(),
            current_time: 1_700_000_000,
            coinbase_value: 5_000_000_000,
            rules: vec![],
            witness_commitment: None,
            transactions: vec![TemplateTx {
                txid: "8c14f0db3df150123e6f3dbbf30f8b955a8249b62ac1d1ff16284aefa3d06d87"
                    .to_string(),
                hash: "8c14f0db3df150123e6f3dbbf30f8b955a8249b62ac1d1ff16284aefa3d06d87"
                    .to_string(),
                data: String::new(), // forces the backfill path
            }],
        }
    }

    fn config(workers: usize, factor: f64) -> MinerConfig {
        MinerConfig {
            payout_address: "bcrt1qtest".to_string(),
            difficulty_factor: Some(factor),
            workers,
            poll_interval_secs: 1,
            timestamp_refresh_secs: 0,
            ..MinerConfig::default()
        }
    }

    #[tokio::test]
    async fn cycle_finds_and_submits_a_block() {
        // A vanishingly small factor saturates the target, so the very
        // first nonce wins.
        let node = Arc::new(MockNode::new(template(), vec!["tip".to_string()]));
        let supervisor = Supervisor::new(config(2, 1e-12), node.clone());

        let outcome = supervisor
            .run_cycle(1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::BlockFound { accepted: true });

        let submitted = node.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        // Backfilled wire bytes made it into the block tail.
        assert!(submitted[0].ends_with("beef"));
        assert_eq!(node.backfilled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submitted_block_parses_back_to_the_solution() {
        let node = Arc::new(MockNode::new(template(), vec!["tip".to_string()]));
        let supervisor = Supervisor::new(config(1, 1e-12), node.clone());

        supervisor
            .run_cycle(1, &CancellationToken::new())
            .await
            .unwrap();

        let submitted = node.submitted.lock().unwrap();
        let block = hex::decode(&submitted[0]).unwrap();

        // Header, then varint tx count of 2 (coinbase + one template tx).
        assert!(block.len() > 81);
        assert_eq!(block[80], 0x02);
        // The height push sits at the start of the coinbase scriptSig.
        let script_at = 81 + 4 + 1 + 36 + 1;
        assert_eq!(block[script_at], 0x02); // two-byte push for height 1000
        assert_eq!(&block[script_at + 1..script_at + 3], &[0xe8, 0x03]);
    }

    #[tokio::test]
    async fn tip_change_supersedes_the_cycle() {
        // An absurdly large factor makes the target unreachable, so only
        // the watchdog can end the cycle.
        let node = Arc::new(MockNode::new(
            template(),
            vec!["tip-a".to_string(), "tip-b".to_string()],
        ));
        let supervisor = Supervisor::new(config(1, 1e30), node.clone());

        let outcome = supervisor
            .run_cycle(1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::Superseded);
        assert!(node.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_supersedes_without_submission() {
        let node = Arc::new(MockNode::new(template(), vec!["tip".to_string()]));
        let supervisor = Supervisor::new(config(1, 1e30), node.clone());

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcome = supervisor.run_cycle(1, &shutdown).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Superseded);
        assert!(node.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn worker_plans_use_disjoint_coinbases() {
        let node = Arc::new(MockNode::new(template(), vec!["tip".to_string()]));
        let supervisor = Supervisor::new(config(4, 1.0), node);

        let mut template = template();
        template.transactions.clear();
        let extranonce1 = Extranonce1::from_hex("1234567890abcdef").unwrap();
        let ranges = Extranonce2Range::new(4).unwrap().split(4).unwrap();

        let plans = supervisor
            .plan_workers(&template, &[0x00, 0x14], &extranonce1, &ranges, 0x207f_ffff)
            .unwrap();

        // Distinct extranonce2 slices produce distinct coinbases, txids,
        // and merkle roots.
        for pair in plans.windows(2) {
            assert_ne!(pair[0].coinbase.bytes, pair[1].coinbase.bytes);
            assert_ne!(pair[0].header.merkle_root, pair[1].header.merkle_root);
        }
    }
}
