//! Pool supervision: template refresh, job publication, share settlement.
//!
//! The pool runs the same cycle as the solo supervisor up to header
//! construction, then stops: instead of searching locally it publishes the
//! split coinbase and merkle branch as a job and waits. Submitted shares
//! come back already validated against the share target; the ones that also
//! clear the network target are rebuilt into a full block, with the same
//! coinbase builder and serializer the solo path uses, and submitted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::server::{AcceptedShare, PoolState};
use crate::artifacts::{ArtifactStore, ShareRecord};
use crate::coinbase::CoinbaseBuilder;
use crate::config::PoolConfig;
use crate::header::serialize_block;
use crate::job::assemble_job;
use crate::rpc::{ExponentialBackoff, NodeClient, SubmitResult};
use crate::supervisor::watchdog;
use crate::target::Target;
use crate::template::BlockTemplate;
use crate::types::{Extranonce1, Extranonce2};

pub struct PoolSupervisor<C> {
    config: PoolConfig,
    client: Arc<C>,
    artifacts: ArtifactStore,
}

impl<C: NodeClient + 'static> PoolSupervisor<C> {
    pub fn new(config: PoolConfig, client: Arc<C>) -> Self {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        Self {
            config,
            client,
            artifacts,
        }
    }

    /// Publish jobs and settle shares until shutdown.
    pub async fn run(
        &self,
        state: Arc<PoolState>,
        mut share_rx: mpsc::Receiver<AcceptedShare>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut cycle: u64 = 0;
        let mut last_prev_hash = String::new();

        while !shutdown.is_cancelled() {
            cycle += 1;

            let prepared = match self.prepare_cycle(cycle, &last_prev_hash, &state).await {
                Ok(prepared) => {
                    backoff.reset();
                    prepared
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(cycle, error = %e, ?delay, "Job cycle failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                    continue;
                }
            };
            last_prev_hash = prepared.template.previous_block_hash.clone();

            // The cycle ends on tip change, on the refresh interval, or on
            // a share that became a block.
            let cancel = shutdown.child_token();
            let watchdog_task = tokio::spawn(watchdog(
                self.client.clone(),
                Duration::from_secs(self.config.poll_interval_secs.max(1)),
                cancel.clone(),
            ));

            let refresh = tokio::time::sleep(Duration::from_secs(
                self.config.refresh_interval_secs.max(1),
            ));
            tokio::pin!(refresh);

            loop {
                tokio::select! {
                    share = share_rx.recv() => {
                        match share {
                            Some(share) => {
                                match self.settle_share(cycle, &prepared, share).await {
                                    Ok(true) => break,  // block submitted, new template
                                    Ok(false) => {}
                                    Err(e) => warn!(error = %e, "Share settlement failed"),
                                }
                            }
                            None => {
                                // Server gone; nothing left to settle.
                                cancel.cancel();
                                watchdog_task.abort();
                                return Ok(());
                            }
                        }
                    }
                    _ = &mut refresh => {
                        debug!(cycle, "Refreshing template");
                        break;
                    }
                    _ = cancel.cancelled() => {
                        info!(cycle, "Job superseded");
                        break;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }

            cancel.cancel();
            watchdog_task.abort();
        }

        Ok(())
    }

    async fn prepare_cycle(
        &self,
        cycle: u64,
        last_prev_hash: &str,
        state: &PoolState,
    ) -> Result<PreparedCycle> {
        let template = self.client.fetch_template().await?;
        let (legacy, segwit) = template.tx_breakdown();
        info!(
            cycle,
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
        let share_target = match self.config.difficulty_factor {
            Some(factor) => Target::from_difficulty_factor(factor)?,
            None => Target::from_compact(bits),
        };

        let extranonce1 = Extranonce1::from_hex(&self.config.extranonce1)?;
        let extranonce2 = Extranonce2::new(0, self.config.extranonce2_size)?;

        let coinbase = CoinbaseBuilder::new(
            &template,
            payout_script.clone(),
            extranonce1.clone(),
            extranonce2,
        )
        .with_message(self.config.coinbase_message.clone())
        .build()?;

        // Work from a previous tip is worthless; work for the same tip
        // survives a mere refresh.
        let clean_jobs = template.previous_block_hash != last_prev_hash;
        let job = assemble_job(
            &template,
            &coinbase,
            &extranonce1,
            &extranonce2,
            share_target,
            clean_jobs,
        )?;

        self.artifacts.record_job(cycle, &job);
        info!(job_id = %job.job_id, clean_jobs, "Publishing job");
        state.publish(job);

        Ok(PreparedCycle {
            template,
            payout_script,
            network_target: Target::from_compact(bits),
        })
    }

    /// Record a share; when it clears the network target, rebuild the full
    /// block and submit it. Returns whether a block was submitted.
    async fn settle_share(
        &self,
        cycle: u64,
        prepared: &PreparedCycle,
        share: AcceptedShare,
    ) -> Result<bool> {
        self.artifacts.record_share(
            cycle,
            &ShareRecord::new(&share.share, &share.check.hash, true),
        );

        if !prepared.network_target.is_met_by(&share.check.hash) {
            debug!(
                worker = %share.share.worker,
                hash = %hex::encode(share.check.hash),
                "Share below network difficulty, recorded only"
            );
            return Ok(false);
        }

        info!(
            worker = %share.share.worker,
            hash = %hex::encode(share.check.hash),
            "Share clears network target, assembling block"
        );

        // Same builder as the job's coinbase, with the worker's extranonce
        // pair; the legacy bytes match what the share validation rebuilt.
        let coinbase = CoinbaseBuilder::new(
            &prepared.template,
            prepared.payout_script.clone(),
            share.extranonce1.clone(),
            share.share.extranonce2,
        )
        .with_message(self.config.coinbase_message.clone())
        .build()?;

        let mut template = prepared.template.clone();
        for tx in &mut template.transactions {
            if tx.data.is_empty() {
                let bytes = self.client.fetch_full_transaction(&tx.txid).await?;
                tx.data = hex::encode(bytes);
            }
        }

        let block = serialize_block(&share.check.header, &coinbase.bytes, &template.transactions)?;

        match self.client.submit_block(&hex::encode(block)).await? {
            SubmitResult::Accepted => {
                info!(hash = %hex::encode(share.check.hash), "Block accepted by node");
                Ok(true)
            }
            SubmitResult::Rejected(reason) => {
                warn!(%reason, "Block rejected by node");
                Ok(false)
            }
        }
    }
}

struct PreparedCycle {
    template: BlockTemplate,
    payout_script: Vec<u8>,
    network_target: Target,
}
