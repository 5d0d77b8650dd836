//! Stratum v1 message types and their JSON wire forms.
//!
//! Every message is one JSON object per line. Requests carry an id echoed
//! in the response; notifications carry a null id and no response. All
//! numeric header fields travel as fixed-width hex strings.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::job::{MiningJob, Share};
use crate::types::Extranonce2;

#[derive(Debug, Error)]
pub enum StratumError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("no job with id {0}")]
    UnknownJob(String),

    #[error("connection stalled")]
    Stalled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A client→server call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, StratumError> {
        serde_json::from_str(line).map_err(|e| StratumError::Malformed(e.to_string()))
    }
}

/// A server→client push with no id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Option<u64>,
    pub method: String,
    pub params: Value,
}

/// Parameters of a `mining.submit` call:
/// `[worker, job_id, extranonce2, ntime, nonce]`, hex fields fixed-width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub extranonce2_hex: String,
    pub ntime: u32,
    pub nonce: u32,
}

impl SubmitParams {
    pub fn parse(params: &Value) -> Result<Self, StratumError> {
        let fields = params
            .as_array()
            .filter(|p| p.len() >= 5)
            .ok_or_else(|| StratumError::Malformed("submit expects 5 params".into()))?;

        let field = |i: usize| -> Result<&str, StratumError> {
            fields[i]
                .as_str()
                .ok_or_else(|| StratumError::Malformed(format!("submit param {i} not a string")))
        };

        Ok(Self {
            worker: field(0)?.to_string(),
            job_id: field(1)?.to_string(),
            extranonce2_hex: field(2)?.to_string(),
            ntime: parse_hex_u32(field(3)?)?,
            nonce: parse_hex_u32(field(4)?)?,
        })
    }

    /// Resolve into a [`Share`] once the connection's extranonce2 size is
    /// known.
    pub fn into_share(self, extranonce2_size: u8) -> Result<Share, StratumError> {
        let extranonce2 = Extranonce2::from_hex(&self.extranonce2_hex, extranonce2_size)
            .map_err(|e| StratumError::Malformed(e.to_string()))?;

        Ok(Share {
            worker: self.worker,
            job_id: self.job_id,
            extranonce2,
            time: self.ntime,
            nonce: self.nonce,
        })
    }
}

fn parse_hex_u32(s: &str) -> Result<u32, StratumError> {
    u32::from_str_radix(s, 16).map_err(|_| StratumError::Malformed(format!("bad hex u32: {s}")))
}

/// `mining.notify` parameters for a job, in protocol order:
/// `[job_id, prevhash, coinb1, coinb2, branch[], version, bits, ntime, clean]`.
///
/// The previous hash is byte-reversed into wire order; branch entries stay
/// in display order, the same convention the validation fold uses.
pub fn notify_params(job: &MiningJob) -> Value {
    let mut prev = job.prev_hash;
    prev.reverse();

    json!([
        job.job_id,
        hex::encode(prev),
        hex::encode(&job.coinb1),
        hex::encode(&job.coinb2),
        job.merkle_branch
            .iter()
            .map(hex::encode)
            .collect::<Vec<_>>(),
        format!("{:08x}", job.version),
        format!("{:08x}", job.bits),
        format!("{:08x}", job.time),
        job.clean_jobs,
    ])
}

/// Serialize a `mining.notify` line for a job.
pub fn notify_line(job: &MiningJob) -> String {
    json!({
        "id": Value::Null,
        "method": "mining.notify",
        "params": notify_params(job),
    })
    .to_string()
}

/// `mining.subscribe` result: subscription ids, the connection extranonce1,
/// and the extranonce2 size workers must use.
pub fn subscribe_result(extranonce1_hex: &str, extranonce2_size: u8) -> Value {
    json!([
        [
            ["mining.set_difficulty", "1"],
            ["mining.notify", "1"]
        ],
        extranonce1_hex,
        extranonce2_size,
    ])
}

/// A successful response line.
pub fn result_line(id: Option<u64>, result: Value) -> String {
    json!({ "id": id, "result": result, "error": Value::Null }).to_string()
}

/// An error response line, `[code, message, traceback]` per convention.
pub fn error_line(id: Option<u64>, code: i64, message: &str) -> String {
    json!({ "id": id, "result": Value::Null, "error": [code, message, Value::Null] }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    fn job() -> MiningJob {
        MiningJob {
            job_id: "6572a9f1".to_string(),
            prev_hash: {
                let mut h = [0u8; 32];
                h[0] = 0xab;
                h[31] = 0xcd;
                h
            },
            coinb1: vec![0x01, 0x02],
            coinb2: vec![0x03, 0x04],
            merkle_branch: vec![[0x11; 32]],
            version: 0x2000_0000,
            bits: 0x1d00_ffff,
            time: 0x6573_0000,
            clean_jobs: true,
            extranonce2_size: 4,
            target: Target::from_compact(0x1d00_ffff),
        }
    }

    #[test]
    fn parses_subscribe_request() {
        let request =
            Request::parse(r#"{"id": 1, "method": "mining.subscribe", "params": ["miner/1.0"]}"#)
                .unwrap();
        assert_eq!(request.id, Some(1));
        assert_eq!(request.method, "mining.subscribe");
        assert_eq!(request.params[0], "miner/1.0");
    }

    #[test]
    fn rejects_non_json_line() {
        assert!(matches!(
            Request::parse("not json at all"),
            Err(StratumError::Malformed(_))
        ));
    }

    #[test]
    fn submit_params_roundtrip() {
        let params = json!(["worker1", "6572a9f1", "deadbeef", "65730000", "00a1b2c3"]);
        let submit = SubmitParams::parse(&params).unwrap();

        assert_eq!(submit.worker, "worker1");
        assert_eq!(submit.job_id, "6572a9f1");
        assert_eq!(submit.ntime, 0x6573_0000);
        assert_eq!(submit.nonce, 0x00a1_b2c3);

        let share = submit.into_share(4).unwrap();
        assert_eq!(share.extranonce2.to_bytes(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn submit_params_reject_short_array_and_bad_hex() {
        assert!(SubmitParams::parse(&json!(["w", "j", "ee"])).is_err());
        assert!(
            SubmitParams::parse(&json!(["w", "j", "ee", "zz", "00000000"])).is_err()
        );

        let submit =
            SubmitParams::parse(&json!(["w", "j", "ee", "65730000", "00000000"])).unwrap();
        assert!(submit.into_share(4).is_err(), "extranonce2 width mismatch");
    }

    #[test]
    fn notify_line_shape() {
        let line = notify_line(&job());
        let value: Value = serde_json::from_str(&line).unwrap();

        assert!(value["id"].is_null());
        assert_eq!(value["method"], "mining.notify");

        let params = value["params"].as_array().unwrap();
        assert_eq!(params.len(), 9);
        assert_eq!(params[0], "6572a9f1");
        // Previous hash is byte-reversed on the wire.
        assert!(params[1].as_str().unwrap().starts_with("cd"));
        assert!(params[1].as_str().unwrap().ends_with("ab"));
        assert_eq!(params[2], "0102");
        assert_eq!(params[3], "0304");
        assert_eq!(params[4].as_array().unwrap().len(), 1);
        assert_eq!(params[5], "20000000");
        assert_eq!(params[6], "1d00ffff");
        assert_eq!(params[8], true);
    }

    #[test]
    fn response_lines_are_single_json_objects() {
        let ok: Value = serde_json::from_str(&result_line(Some(2), json!(true))).unwrap();
        assert_eq!(ok["id"], 2);
        assert_eq!(ok["result"], true);
        assert!(ok["error"].is_null());

        let err: Value =
            serde_json::from_str(&error_line(Some(3), 20, "unknown method")).unwrap();
        assert!(err["result"].is_null());
        assert_eq!(err["error"][0], 20);
    }

    #[test]
    fn subscribe_result_shape() {
        let value = subscribe_result("1234567890abcdef", 4);
        assert_eq!(value[1], "1234567890abcdef");
        assert_eq!(value[2], 4);
        assert_eq!(value[0][0][0], "mining.set_difficulty");
    }
}
