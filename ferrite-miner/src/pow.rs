//! Cancellable, batched nonce search over a fixed header prefix.
//!
//! The first 76 header bytes never change within a batch, so their SHA-256
//! state is computed once and cloned per candidate; each attempt only hashes
//! the 4 nonce bytes on top of it, then the second SHA-256 pass. The
//! timestamp is refreshed on a configurable interval, which re-derives the
//! prefix state without restarting the search.
//!
//! Cancellation is cooperative: the token is checked once per batch, so a
//! stale-template signal bounds worst-case latency to one batch. A
//! cancelled search is a first-class outcome, never an error and never a
//! fabricated solution.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::encode::swap_endian_32;
use crate::header::BlockHeader;
use crate::target::Target;
use crate::types::HashRate;

/// Candidates tried between cancellation checks. Larger batches amortize
/// the check; smaller ones tighten cancellation latency.
pub const BATCH_SIZE: usize = 4096;

/// How the next candidate nonce is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoncePolicy {
    /// 0, 1, 2, … wrapping at 2^32.
    Incremental,

    /// Uniform over 32 bits on every attempt.
    Random,

    /// One random starting point, then incremental.
    Mixed,
}

/// Tuning knobs for the search loop.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub batch_size: usize,

    /// Refresh the header timestamp this often. `None` leaves it fixed.
    pub timestamp_refresh: Option<Duration>,

    /// Wall-clock cadence of status reports, independent of attempt rate.
    pub status_interval: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            timestamp_refresh: Some(Duration::from_secs(30)),
            status_interval: Duration::from_secs(2),
        }
    }
}

/// Periodic progress report emitted while searching.
#[derive(Debug, Clone, Copy)]
pub struct SearchStatus {
    pub attempts: u64,
    pub hashrate: HashRate,
}

/// A successfully mined header.
#[derive(Debug, Clone)]
pub struct Solution {
    /// The completed header, timestamp and nonce included.
    pub header: BlockHeader,
    pub nonce: u32,

    /// Header hash in display order; already verified against the target.
    pub hash: [u8; 32],
    pub attempts: u64,
    pub hashrate: HashRate,
}

/// Terminal result of a search. Cancellation is representable, not a
/// sentinel.
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Found(Solution),
    Cancelled,
}

/// Candidate nonce sequence for a policy.
///
/// Random values come from a hasher over OS-seeded `RandomState`, which is
/// plenty uniform for spreading search starting points and avoids carrying
/// a dedicated RNG dependency.
struct NonceSeq {
    policy: NoncePolicy,
    state: RandomState,
    step: u64,
    next: u32,
}

impl NonceSeq {
    fn new(policy: NoncePolicy) -> Self {
        let state = RandomState::new();
        let mut seq = Self {
            policy,
            state,
            step: 0,
            next: 0,
        };
        seq.next = match policy {
            NoncePolicy::Incremental => 0,
            NoncePolicy::Random | NoncePolicy::Mixed => seq.draw(),
        };
        seq
    }

    fn draw(&mut self) -> u32 {
        let mut hasher = self.state.build_hasher();
        hasher.write_u64(self.step);
        self.step = self.step.wrapping_add(1);
        hasher.finish() as u32
    }

    fn next(&mut self) -> u32 {
        let nonce = self.next;
        self.next = match self.policy {
            NoncePolicy::Random => self.draw(),
            NoncePolicy::Incremental | NoncePolicy::Mixed => nonce.wrapping_add(1),
        };
        nonce
    }
}

fn midstate(prefix: &[u8; 76]) -> Sha256 {
    let mut state = Sha256::new();
    state.update(prefix);
    state
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Search for a nonce whose header hash satisfies `target`.
///
/// Runs on the calling thread; put it on a blocking worker. `status` is
/// invoked on the configured wall-clock cadence.
pub fn search(
    mut header: BlockHeader,
    target: Target,
    policy: NoncePolicy,
    options: &SearchOptions,
    cancel: &CancellationToken,
    mut status: impl FnMut(SearchStatus),
) -> SearchOutcome {
    let mut seq = NonceSeq::new(policy);
    let mut state = midstate(&header.prefix());

    let started = Instant::now();
    let mut attempts: u64 = 0;
    let mut last_status = started;
    let mut last_status_attempts: u64 = 0;
    let mut last_refresh = started;

    loop {
        if cancel.is_cancelled() {
            info!(attempts, "Search cancelled");
            return SearchOutcome::Cancelled;
        }

        if let Some(interval) = options.timestamp_refresh {
            if last_refresh.elapsed() >= interval {
                header.time = unix_now();
                state = midstate(&header.prefix());
                last_refresh = Instant::now();
                debug!(time = header.time, "Header timestamp refreshed");
            }
        }

        for _ in 0..options.batch_size {
            let nonce = seq.next();

            let mut first = state.clone();
            first.update(nonce.to_le_bytes());
            let digest: [u8; 32] = Sha256::digest(first.finalize()).into();
            let hash = swap_endian_32(digest);
            attempts += 1;

            if target.is_met_by(&hash) {
                header.nonce = nonce;
                let hashrate =
                    HashRate::from_attempts(attempts, started.elapsed().as_secs_f64());
                info!(
                    nonce,
                    attempts,
                    hash = %hex::encode(hash),
                    %hashrate,
                    "Solution found"
                );
                return SearchOutcome::Found(Solution {
                    header,
                    nonce,
                    hash,
                    attempts,
                    hashrate,
                });
            }
        }

        let now = Instant::now();
        if now.duration_since(last_status) >= options.status_interval {
            let hashrate = HashRate::from_attempts(
                attempts - last_status_attempts,
                now.duration_since(last_status).as_secs_f64(),
            );
            status(SearchStatus { attempts, hashrate });
            last_status = now;
            last_status_attempts = attempts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::POOL_MAX_BITS;
    use test_case::test_case;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 0x2000_0000,
            prev_hash: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1_700_000_000,
            bits: POOL_MAX_BITS,
            nonce: 0,
        }
    }

    #[test_case(NoncePolicy::Incremental)]
    #[test_case(NoncePolicy::Random)]
    #[test_case(NoncePolicy::Mixed)]
    fn max_target_succeeds_on_first_attempt(policy: NoncePolicy) {
        let outcome = search(
            header(),
            Target::MAX,
            policy,
            &SearchOptions::default(),
            &CancellationToken::new(),
            |_| {},
        );

        match outcome {
            SearchOutcome::Found(solution) => {
                assert_eq!(solution.attempts, 1);
                assert_eq!(solution.header.nonce, solution.nonce);
            }
            SearchOutcome::Cancelled => panic!("expected a solution"),
        }
    }

    #[test]
    fn solution_hash_matches_header() {
        let outcome = search(
            header(),
            Target::MAX,
            NoncePolicy::Incremental,
            &SearchOptions::default(),
            &CancellationToken::new(),
            |_| {},
        );

        let SearchOutcome::Found(solution) = outcome else {
            panic!("expected a solution");
        };
        assert_eq!(solution.header.hash(), solution.hash);
    }

    #[test]
    fn pre_raised_cancellation_wins_over_search() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut reported = false;
        let outcome = search(
            header(),
            Target::MAX,
            NoncePolicy::Incremental,
            &SearchOptions::default(),
            &cancel,
            |_| reported = true,
        );

        assert!(matches!(outcome, SearchOutcome::Cancelled));
        assert!(!reported, "no status should be reported before the first batch");
    }

    #[test]
    fn incremental_sequence_starts_at_zero() {
        let mut seq = NonceSeq::new(NoncePolicy::Incremental);
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn incremental_wraps_at_u32_max() {
        let mut seq = NonceSeq::new(NoncePolicy::Incremental);
        seq.next = u32::MAX;
        assert_eq!(seq.next(), u32::MAX);
        assert_eq!(seq.next(), 0);
    }

    #[test]
    fn mixed_runs_incrementally_after_seed() {
        let mut seq = NonceSeq::new(NoncePolicy::Mixed);
        let first = seq.next();
        assert_eq!(seq.next(), first.wrapping_add(1));
        assert_eq!(seq.next(), first.wrapping_add(2));
    }

    #[test]
    fn midstate_equals_full_hash() {
        // Cloned prefix state plus nonce bytes must equal hashing the whole
        // 80-byte header at once.
        let h = header();
        let nonce: u32 = 0x0102_0304;

        let mut state = midstate(&h.prefix());
        state.update(nonce.to_le_bytes());
        let via_midstate: [u8; 32] = Sha256::digest(state.finalize()).into();

        let mut full = h;
        full.nonce = nonce;
        assert_eq!(swap_endian_32(via_midstate), full.hash());
    }
}
