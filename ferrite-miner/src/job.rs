//! Job assembly and share validation for the pool protocol.
//!
//! A job carries the coinbase split around the extranonce region plus the
//! merkle branch, which is everything a remote worker needs to rebuild the
//! merkle root for any extranonce2 it chooses. Share validation runs the
//! same reconstruction on the server side and accepts the share iff the
//! resulting header hash meets the job target.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::coinbase::Coinbase;
use crate::encode::{hash_from_hex, sha256d, swap_endian_32};
use crate::header::BlockHeader;
use crate::merkle::{fold_branch, merkle_branch};
use crate::target::Target;
use crate::template::BlockTemplate;
use crate::types::{Extranonce1, Extranonce2};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("extranonce1 not found in coinbase")]
    ExtranonceNotFound,

    #[error("extranonce2 does not immediately follow extranonce1")]
    ExtranonceMisaligned,

    #[error("extranonce2 is {got} bytes, job requires {expected}")]
    WrongExtranonce2Size { expected: u8, got: u8 },

    #[error("template carries invalid txid hex: {0}")]
    BadTxid(String),

    #[error("template carries invalid previous block hash: {0}")]
    BadPrevHash(String),
}

/// Coinbase halves surrounding the extranonce region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCoinbase {
    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
}

/// Split a serialized coinbase around the contiguous extranonce1‖extranonce2
/// run.
///
/// The cut is exact: `coinb1` ends one byte before extranonce1 and `coinb2`
/// starts one byte after extranonce2. Failure to locate the run, or finding
/// extranonce2 not adjacent, is a data-integrity error: the coinbase was
/// not built the way this layer expects.
pub fn split_coinbase(
    bytes: &[u8],
    extranonce1: &Extranonce1,
    extranonce2: &Extranonce2,
) -> Result<SplitCoinbase, JobError> {
    let en1 = extranonce1.as_bytes();
    let en2 = extranonce2.to_bytes();

    let at = bytes
        .windows(en1.len())
        .position(|w| w == en1)
        .ok_or(JobError::ExtranonceNotFound)?;

    let en2_at = at + en1.len();
    if bytes.len() < en2_at + en2.len() || bytes[en2_at..en2_at + en2.len()] != en2[..] {
        return Err(JobError::ExtranonceMisaligned);
    }

    Ok(SplitCoinbase {
        coinb1: bytes[..at].to_vec(),
        coinb2: bytes[en2_at + en2.len()..].to_vec(),
    })
}

/// A unit of distributable work, created once per template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningJob {
    pub job_id: String,

    /// Previous block hash, display order.
    pub prev_hash: [u8; 32],

    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,

    /// Coinbase authentication branch, display order, root-ward.
    pub merkle_branch: Vec<[u8; 32]>,

    pub version: i32,
    pub bits: u32,
    pub time: u32,

    /// Whether in-flight work from previous jobs must be abandoned.
    pub clean_jobs: bool,

    pub extranonce2_size: u8,

    /// Share acceptance threshold; decodes from `bits`.
    pub target: Target,
}

/// A worker's candidate solution for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: Extranonce2,
    pub time: u32,
    pub nonce: u32,
}

/// Result of revalidating a submitted share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareCheck {
    pub accepted: bool,

    /// Recomputed header hash, display order.
    pub hash: [u8; 32],

    /// The header the share describes.
    pub header: BlockHeader,

    /// Txid of the reconstructed coinbase.
    pub coinbase_txid: [u8; 32],
}

/// Package a template and built coinbase into a distributable job.
///
/// The merkle branch is extracted for leaf index 0 (the coinbase is always
/// the first transaction), so it does not depend on the coinbase hash
/// itself and stays valid for every extranonce2 a worker picks.
pub fn assemble_job(
    template: &BlockTemplate,
    coinbase: &Coinbase,
    extranonce1: &Extranonce1,
    extranonce2: &Extranonce2,
    target: Target,
    clean_jobs: bool,
) -> Result<MiningJob, JobError> {
    let split = split_coinbase(&coinbase.legacy_bytes, extranonce1, extranonce2)?;

    let mut leaves = Vec::with_capacity(template.transactions.len() + 1);
    leaves.push([0u8; 32]); // coinbase placeholder, irrelevant to its own branch
    for tx in &template.transactions {
        leaves.push(hash_from_hex(&tx.txid).map_err(|_| JobError::BadTxid(tx.txid.clone()))?);
    }

    let prev_hash = hash_from_hex(&template.previous_block_hash)
        .map_err(|_| JobError::BadPrevHash(template.previous_block_hash.clone()))?;

    Ok(MiningJob {
        job_id: next_job_id(),
        prev_hash,
        coinb1: split.coinb1,
        coinb2: split.coinb2,
        merkle_branch: merkle_branch(&leaves, 0),
        version: template.version,
        bits: target.to_compact(),
        time: template.current_time,
        clean_jobs,
        extranonce2_size: extranonce2.size(),
        target,
    })
}

/// Rebuild the block a share describes and check it against the job target.
pub fn validate_share(
    job: &MiningJob,
    extranonce1: &Extranonce1,
    share: &Share,
) -> Result<ShareCheck, JobError> {
    if share.extranonce2.size() != job.extranonce2_size {
        return Err(JobError::WrongExtranonce2Size {
            expected: job.extranonce2_size,
            got: share.extranonce2.size(),
        });
    }

    let coinbase_bytes = rebuild_coinbase(job, extranonce1, &share.extranonce2);
    let coinbase_txid = swap_endian_32(sha256d(&coinbase_bytes));

    let merkle_root = fold_branch(&coinbase_txid, &job.merkle_branch, 0);

    let header = BlockHeader {
        version: job.version,
        prev_hash: job.prev_hash,
        merkle_root,
        time: share.time,
        bits: job.bits,
        nonce: share.nonce,
    };

    let hash = header.hash();
    Ok(ShareCheck {
        accepted: job.target.is_met_by(&hash),
        hash,
        header,
        coinbase_txid,
    })
}

/// Reassemble the legacy coinbase for a given extranonce pair.
pub fn rebuild_coinbase(
    job: &MiningJob,
    extranonce1: &Extranonce1,
    extranonce2: &Extranonce2,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(
        job.coinb1.len() + extranonce1.len() + extranonce2.size() as usize + job.coinb2.len(),
    );
    bytes.extend_from_slice(&job.coinb1);
    bytes.extend_from_slice(extranonce1.as_bytes());
    bytes.extend_from_slice(&extranonce2.to_bytes());
    bytes.extend_from_slice(&job.coinb2);
    bytes
}

/// Job ids are derived from a millisecond clock, unique enough across the
/// lifetime of a job map that also keys on them.
fn next_job_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    format!("{:08x}", millis & 0xffff_ffff)
}
