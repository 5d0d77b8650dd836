//! Coinbase transaction construction.
//!
//! The coinbase is the one transaction the miner authors itself: it claims
//! the block reward, commits to the block height (BIP34), and carries the
//! extranonce bytes that diversify the search space. The canonical scriptSig
//! layout used throughout this crate is
//!
//! ```text
//! push(height) ‖ push(message)? ‖ extranonce1 ‖ extranonce2
//! ```
//!
//! with the extranonces as one contiguous raw byte run, which is what the
//! job layer's split relies on. ntime and bits are never embedded.

use thiserror::Error;

use crate::encode::{sha256d, swap_endian_32, write_varint};
use crate::template::BlockTemplate;
use crate::types::{Extranonce1, Extranonce2};

/// Consensus limit on the coinbase scriptSig length.
pub const MAX_SCRIPT_SIG: usize = 100;

/// Transaction format version used for the coinbase.
const TX_VERSION: u32 = 2;

/// Magic prefix of the witness commitment output script.
const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoinbaseError {
    #[error("coinbase scriptSig is {0} bytes, limit is {MAX_SCRIPT_SIG}")]
    ScriptSigTooLong(usize),

    #[error("invalid witness commitment hex: {0}")]
    InvalidCommitment(String),
}

/// A built coinbase transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coinbase {
    /// Full wire encoding; includes marker, flag, and witness stack when
    /// the template is segwit.
    pub bytes: Vec<u8>,

    /// Witness-stripped encoding. Equal to `bytes` for legacy templates.
    /// This is the serialization the stratum split operates on.
    pub legacy_bytes: Vec<u8>,

    /// Legacy transaction id (hash of `legacy_bytes`), display order.
    pub txid: [u8; 32],

    /// Witness-inclusive id (hash of `bytes`), display order.
    pub wtxid: [u8; 32],
}

/// Builder assembling a coinbase from template fields and extranonces.
pub struct CoinbaseBuilder<'a> {
    template: &'a BlockTemplate,
    payout_script: Vec<u8>,
    extranonce1: Extranonce1,
    extranonce2: Extranonce2,
    message: Option<String>,
}

impl<'a> CoinbaseBuilder<'a> {
    pub fn new(
        template: &'a BlockTemplate,
        payout_script: Vec<u8>,
        extranonce1: Extranonce1,
        extranonce2: Extranonce2,
    ) -> Self {
        Self {
            template,
            payout_script,
            extranonce1,
            extranonce2,
            message: None,
        }
    }

    /// Add a miner tag pushed into the scriptSig after the height.
    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn build(&self) -> Result<Coinbase, CoinbaseError> {
        let script_sig = self.build_script_sig()?;
        let outputs = self.build_outputs()?;
        let segwit = self.template.segwit_active();

        let legacy_bytes = self.serialize(&script_sig, &outputs, false);
        let bytes = if segwit {
            self.serialize(&script_sig, &outputs, true)
        } else {
            legacy_bytes.clone()
        };

        let txid = swap_endian_32(sha256d(&legacy_bytes));
        let wtxid = swap_endian_32(sha256d(&bytes));

        Ok(Coinbase {
            bytes,
            legacy_bytes,
            txid,
            wtxid,
        })
    }

    fn build_script_sig(&self) -> Result<Vec<u8>, CoinbaseError> {
        let mut script = Vec::with_capacity(MAX_SCRIPT_SIG);

        let height = encode_height(self.template.height);
        script.push(height.len() as u8);
        script.extend_from_slice(&height);

        if let Some(message) = &self.message {
            let bytes = message.as_bytes();
            script.push(bytes.len() as u8);
            script.extend_from_slice(bytes);
        }

        script.extend_from_slice(self.extranonce1.as_bytes());
        script.extend_from_slice(&self.extranonce2.to_bytes());

        if script.len() > MAX_SCRIPT_SIG {
            return Err(CoinbaseError::ScriptSigTooLong(script.len()));
        }

        Ok(script)
    }

    fn build_outputs(&self) -> Result<Vec<(u64, Vec<u8>)>, CoinbaseError> {
        let mut outputs = Vec::with_capacity(2);
        outputs.push((self.template.coinbase_value, self.payout_script.clone()));

        if self.template.segwit_active() {
            if let Some(commitment) = &self.template.witness_commitment {
                outputs.push((0, commitment_script(commitment)?));
            }
        }

        Ok(outputs)
    }

    fn serialize(&self, script_sig: &[u8], outputs: &[(u64, Vec<u8>)], witness: bool) -> Vec<u8> {
        let mut tx = Vec::with_capacity(256);

        tx.extend_from_slice(&TX_VERSION.to_le_bytes());
        if witness {
            tx.push(0x00); // marker
            tx.push(0x01); // flag
        }

        // One input spending the null prevout.
        tx.push(0x01);
        tx.extend_from_slice(&[0u8; 32]);
        tx.extend_from_slice(&u32::MAX.to_le_bytes());
        write_varint(&mut tx, script_sig.len() as u64);
        tx.extend_from_slice(script_sig);
        tx.extend_from_slice(&u32::MAX.to_le_bytes()); // sequence

        write_varint(&mut tx, outputs.len() as u64);
        for (value, script) in outputs {
            tx.extend_from_slice(&value.to_le_bytes());
            write_varint(&mut tx, script.len() as u64);
            tx.extend_from_slice(script);
        }

        if witness {
            // One stack of one 32-byte reserved element, all zeros.
            tx.push(0x01);
            tx.push(0x20);
            tx.extend_from_slice(&[0u8; 32]);
        }

        tx.extend_from_slice(&0u32.to_le_bytes()); // locktime
        tx
    }
}

/// Build the witness commitment output script.
///
/// The template may carry either a finished OP_RETURN script or just the
/// 32-byte commitment root; a bare root gets wrapped in the standard
/// header.
fn commitment_script(commitment: &str) -> Result<Vec<u8>, CoinbaseError> {
    let bytes =
        hex::decode(commitment).map_err(|_| CoinbaseError::InvalidCommitment(commitment.into()))?;

    if bytes.first() == Some(&0x6a) {
        return Ok(bytes);
    }
    if bytes.len() != 32 {
        return Err(CoinbaseError::InvalidCommitment(commitment.into()));
    }

    let mut script = Vec::with_capacity(38);
    script.extend_from_slice(&WITNESS_COMMITMENT_HEADER);
    script.extend_from_slice(&bytes);
    Ok(script)
}

/// BIP34 height encoding: minimal little-endian bytes, with a zero byte
/// appended when the top bit of the last byte is set, so the value cannot
/// read as negative. Height 0 encodes as the empty push.
pub fn encode_height(height: u64) -> Vec<u8> {
    if height == 0 {
        return Vec::new();
    }

    let mut bytes = Vec::with_capacity(4);
    let mut v = height;
    while v > 0 {
        bytes.push((v & 0xff) as u8);
        v >>= 8;
    }

    if bytes.last().is_some_and(|&b| b & 0x80 != 0) {
        bytes.push(0x00);
    }

    bytes
}

/// Inverse of [`encode_height`] over a height push at the front of a
/// scriptSig. Returns the height and the bytes consumed.
pub fn decode_height(script: &[u8]) -> Option<(u64, usize)> {
    let len = *script.first()? as usize;
    if len > 8 || script.len() < 1 + len {
        return None;
    }

    let mut value = 0u64;
    for (i, &byte) in script[1..1 + len].iter().enumerate() {
        value |= (byte as u64) << (8 * i);
    }
    Some((value, 1 + len))
}
