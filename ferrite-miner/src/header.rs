//! Block header and full block serialization.
//!
//! The header is a fixed 80 bytes: version ‖ prev-hash ‖ merkle-root ‖
//! time ‖ bits ‖ nonce, every field little-endian on the wire. Hashes live
//! in display order inside [`BlockHeader`] and are reversed at
//! serialization time.

use thiserror::Error;

use crate::encode::{sha256d, swap_endian_32, write_varint};
use crate::template::TemplateTx;

/// Length of the serialized header.
pub const HEADER_LEN: usize = 80;

/// Length of the header prefix that stays fixed while rolling the nonce.
pub const HEADER_PREFIX_LEN: usize = 76;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("transaction {txid} has no wire bytes")]
    MissingTxData { txid: String },

    #[error("transaction {txid} wire bytes are not valid hex")]
    BadTxData { txid: String },
}

/// An 80-byte block header in field form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,

    /// Previous block hash, display order.
    pub prev_hash: [u8; 32],

    /// Transaction merkle root, display order.
    pub merkle_root: [u8; 32],

    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Wire serialization of all six fields.
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..HEADER_PREFIX_LEN].copy_from_slice(&self.prefix());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// The 76 bytes preceding the nonce, the unit over which the search
    /// loop precomputes its hash state.
    pub fn prefix(&self) -> [u8; HEADER_PREFIX_LEN] {
        let mut out = [0u8; HEADER_PREFIX_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&swap_endian_32(self.prev_hash));
        out[36..68].copy_from_slice(&swap_endian_32(self.merkle_root));
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out
    }

    /// Header hash in display order.
    pub fn hash(&self) -> [u8; 32] {
        swap_endian_32(sha256d(&self.serialize()))
    }
}

/// Serialize a complete block: header ‖ varint(tx count) ‖ coinbase ‖
/// transactions in template order.
///
/// The coinbase is serialized in its witness-inclusive form. Any template
/// transaction without wire bytes aborts the serialization; a partial block
/// would be rejected by the node anyway.
pub fn serialize_block(
    header: &BlockHeader,
    coinbase_bytes: &[u8],
    transactions: &[TemplateTx],
) -> Result<Vec<u8>, BlockError> {
    let mut block = Vec::with_capacity(HEADER_LEN + coinbase_bytes.len() + 1);

    block.extend_from_slice(&header.serialize());
    write_varint(&mut block, transactions.len() as u64 + 1);
    block.extend_from_slice(coinbase_bytes);

    for tx in transactions {
        if tx.data.is_empty() {
            return Err(BlockError::MissingTxData {
                txid: tx.txid.clone(),
            });
        }
        let bytes = hex::decode(&tx.data).map_err(|_| BlockError::BadTxData {
            txid: tx.txid.clone(),
        })?;
        block.extend_from_slice(&bytes);
    }

    Ok(block)
}
