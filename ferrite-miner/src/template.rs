//! Typed model of the node's `getblocktemplate` response.
//!
//! The template is read-only input: fetched once per mining cycle and
//! discarded when a new best block is observed. Every derived artifact
//! (coinbase, merkle tree, header) is owned by the cycle that built it.

use serde::{Deserialize, Serialize};

/// One candidate transaction from the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTx {
    /// Transaction id, display-order hex.
    pub txid: String,

    /// Witness-inclusive hash, display-order hex. Equals `txid` for legacy
    /// transactions.
    pub hash: String,

    /// Full wire encoding, hex. May be empty when the node omits it; block
    /// serialization treats that as a data-integrity failure.
    #[serde(default)]
    pub data: String,
}

impl TemplateTx {
    /// Whether the wire encoding carries the segwit marker and flag.
    ///
    /// Segwit serializations place `00 01` immediately after the 4 version
    /// bytes, which is hex offset 8.
    pub fn is_segwit(&self) -> bool {
        self.data.len() >= 12 && &self.data[8..12] == "0001"
    }
}

/// A block-construction proposal from the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    /// Protocol version for the new block's header.
    pub version: i32,

    /// Height of the block being built.
    pub height: u64,

    /// Hash of the chain tip, display-order hex.
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,

    /// Compact difficulty target, hex (e.g. "1d00ffff").
    pub bits: String,

    /// Node's current time, the starting header timestamp.
    #[serde(rename = "curtime")]
    pub current_time: u32,

    /// Block subsidy plus fees, in the chain's base unit.
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,

    /// Deployment rules active for this template.
    #[serde(default)]
    pub rules: Vec<String>,

    /// Witness commitment, either a ready OP_RETURN script or a bare
    /// 32-byte root, hex. Present iff the node wants a segwit block.
    #[serde(
        rename = "default_witness_commitment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub witness_commitment: Option<String>,

    /// Candidate transactions in template order, coinbase excluded.
    #[serde(default)]
    pub transactions: Vec<TemplateTx>,
}

impl BlockTemplate {
    /// Whether the coinbase must be built in segwit form.
    ///
    /// An explicit `!segwit` rule forces legacy even when the node supplied
    /// a witness commitment; otherwise the `segwit` rule or a present
    /// commitment enables it.
    pub fn segwit_active(&self) -> bool {
        if self.rules.iter().any(|r| r == "!segwit") {
            return false;
        }
        self.rules.iter().any(|r| r == "segwit") || self.witness_commitment.is_some()
    }

    /// The compact bits parsed to an integer.
    pub fn bits_u32(&self) -> Result<u32, std::num::ParseIntError> {
        u32::from_str_radix(&self.bits, 16)
    }

    /// Count of (legacy, segwit) transactions, for cycle logging.
    pub fn tx_breakdown(&self) -> (usize, usize) {
        let segwit = self.transactions.iter().filter(|tx| tx.is_segwit()).count();
        (self.transactions.len() - segwit, segwit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_template() -> BlockTemplate {
        serde_json::from_value(serde_json::json!({
            "version": 0x2000_0000,
            "height": 850000,
            "previousblockhash":
                "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054",
            "bits": "17034219",
            "curtime": 1718900000,
            "coinbasevalue": 625_000_000u64,
            "rules": ["csv", "segwit", "taproot"],
            "default_witness_commitment":
                "6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9",
            "transactions": [
                {
                    "txid": "8c14f0db3df150123e6f3dbbf30f8b955a8249b62ac1d1ff16284aefa3d06d87",
                    "hash": "8c14f0db3df150123e6f3dbbf30f8b955a8249b62ac1d1ff16284aefa3d06d87",
                    "data": "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff00ffffffff0100f2052a010000000000000000"
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn deserializes_node_field_names() {
        let template = sample_template();
        assert_eq!(template.height, 850000);
        assert_eq!(template.current_time, 1718900000);
        assert_eq!(template.coinbase_value, 625_000_000);
        assert_eq!(template.bits_u32().unwrap(), 0x17034219);
    }

    #[test]
    fn segwit_rule_detection() {
        let mut template = sample_template();
        assert!(template.segwit_active());

        // Explicit opt-out wins over a present commitment.
        template.rules.push("!segwit".to_string());
        assert!(!template.segwit_active());

        // A commitment alone is enough.
        let mut template = sample_template();
        template.rules = vec![];
        assert!(template.segwit_active());

        template.witness_commitment = None;
        assert!(!template.segwit_active());
    }

    #[test]
    fn segwit_tx_sniffing() {
        let legacy = TemplateTx {
            txid: String::new(),
            hash: String::new(),
            data: "01000000016f3d".to_string(),
        };
        assert!(!legacy.is_segwit());

        let segwit = TemplateTx {
            txid: String::new(),
            hash: String::new(),
            data: "010000000001016f3d".to_string(),
        };
        assert!(segwit.is_segwit());

        let (legacy_count, segwit_count) = sample_template().tx_breakdown();
        assert_eq!((legacy_count, segwit_count), (1, 0));
    }

    #[test]
    fn missing_optional_fields_default() {
        let template: BlockTemplate = serde_json::from_value(serde_json::json!({
            "version": 1,
            "height": 0,
            "previousblockhash": "00".repeat(32),
            "bits": "207fffff",
            "curtime": 0,
            "coinbasevalue": 5_000_000_000u64
        }))
        .unwrap();

        assert!(template.rules.is_empty());
        assert!(template.transactions.is_empty());
        assert!(template.witness_commitment.is_none());
        assert!(!template.segwit_active());
    }
}
