//! Cycle-keyed debug records for replay and post-mortems.
//!
//! Each mining cycle can leave behind the template it started from, the job
//! it distributed, and the last share it saw, as standalone JSON files.
//! Persistence is strictly best-effort: a full disk must never stop the
//! miner, so failures are logged and swallowed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::job::{MiningJob, Share};
use crate::template::BlockTemplate;

/// Serialized form of a [`MiningJob`], byte fields hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub prev_hash: String,
    pub coinb1: String,
    pub coinb2: String,
    pub merkle_branch: Vec<String>,
    pub version: i32,
    pub bits: String,
    pub time: u32,
    pub clean_jobs: bool,
    pub extranonce2_size: u8,
}

impl From<&MiningJob> for JobRecord {
    fn from(job: &MiningJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            prev_hash: hex::encode(job.prev_hash),
            coinb1: hex::encode(&job.coinb1),
            coinb2: hex::encode(&job.coinb2),
            merkle_branch: job.merkle_branch.iter().map(hex::encode).collect(),
            version: job.version,
            bits: format!("{:08x}", job.bits),
            time: job.time,
            clean_jobs: job.clean_jobs,
            extranonce2_size: job.extranonce2_size,
        }
    }
}

/// Serialized form of a submitted share and its verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub time: u32,
    pub nonce: u32,
    pub hash: String,
    pub accepted: bool,
}

impl ShareRecord {
    pub fn new(share: &Share, hash: &[u8; 32], accepted: bool) -> Self {
        Self {
            worker: share.worker.clone(),
            job_id: share.job_id.clone(),
            extranonce2: share.extranonce2.to_string(),
            time: share.time,
            nonce: share.nonce,
            hash: hex::encode(hash),
            accepted,
        }
    }
}

/// Best-effort writer of cycle-keyed records.
pub struct ArtifactStore {
    dir: Option<PathBuf>,
}

impl ArtifactStore {
    /// `None` disables persistence entirely.
    pub fn new(dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "Cannot create artifacts directory");
            }
        }
        Self { dir }
    }

    pub fn record_template(&self, cycle: u64, template: &BlockTemplate) {
        self.write(cycle, "template", template);
    }

    pub fn record_job(&self, cycle: u64, job: &MiningJob) {
        self.write(cycle, "job", &JobRecord::from(job));
    }

    pub fn record_share(&self, cycle: u64, share: &ShareRecord) {
        self.write(cycle, "share", share);
    }

    fn write<T: Serialize>(&self, cycle: u64, kind: &str, value: &T) {
        let Some(dir) = &self.dir else {
            return;
        };

        let path = dir.join(format!("cycle-{cycle:06}-{kind}.json"));
        let result = serde_json::to_string_pretty(value)
            .map_err(std::io::Error::other)
            .and_then(|text| std::fs::write(&path, text));

        match result {
            Ok(()) => debug!(path = %path.display(), "Artifact recorded"),
            Err(e) => warn!(path = %path.display(), error = %e, "Artifact not recorded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    fn job() -> MiningJob {
        MiningJob {
            job_id: "6572a9f1".to_string(),
            prev_hash: [0xab; 32],
            coinb1: vec![1, 2, 3],
            coinb2: vec![4, 5],
            merkle_branch: vec![[0x11; 32]],
            version: 0x2000_0000,
            bits: 0x1d00_ffff,
            time: 1_700_000_000,
            clean_jobs: false,
            extranonce2_size: 4,
            target: Target::from_compact(0x1d00_ffff),
        }
    }

    #[test]
    fn records_land_as_parseable_json() {
        let dir = std::env::temp_dir().join("ferrite-artifacts-test");
        let _ = std::fs::remove_dir_all(&dir);
        let store = ArtifactStore::new(Some(dir.clone()));

        store.record_job(42, &job());

        let text = std::fs::read_to_string(dir.join("cycle-000042-job.json")).unwrap();
        let record: JobRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(record.job_id, "6572a9f1");
        assert_eq!(record.coinb1, "010203");
        assert_eq!(record.bits, "1d00ffff");
    }

    #[test]
    fn disabled_store_is_a_no_op() {
        // Nothing to assert beyond "does not panic and writes nothing".
        let store = ArtifactStore::new(None);
        store.record_job(1, &job());
    }
}
