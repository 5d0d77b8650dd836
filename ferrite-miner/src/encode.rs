//! Binary primitives shared by the transaction, block, and merkle layers.
//!
//! Bitcoin stores integers little-endian on the wire but displays hashes
//! byte-reversed. Everything in this crate keeps hashes in display order at
//! API boundaries and converts to wire order at serialization time, so the
//! conversion helpers here must be their own inverse.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from the variable-length integer decoder.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("varint payload truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("empty input")]
    Empty,
}

/// Append a Bitcoin variable-length integer to `out`.
///
/// Values below 0xFD encode as a single byte; larger values use a one-byte
/// prefix (0xFD/0xFE/0xFF) followed by a 2/4/8-byte little-endian payload.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Encode a value as a standalone varint byte vector.
pub fn varint(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    write_varint(&mut out, value);
    out
}

/// Decode a varint from the front of `input`.
///
/// Returns the value and the number of bytes consumed. Payloads wider than
/// 8 bytes are unrepresentable in the encoding, so the only failure modes
/// are an empty input and a truncated payload.
pub fn read_varint(input: &[u8]) -> Result<(u64, usize), EncodeError> {
    let first = *input.first().ok_or(EncodeError::Empty)?;

    let width = match first {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        _ => return Ok((first as u64, 1)),
    };

    if input.len() < 1 + width {
        return Err(EncodeError::Truncated {
            need: 1 + width,
            have: input.len(),
        });
    }

    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&input[1..1 + width]);
    Ok((u64::from_le_bytes(buf), 1 + width))
}

/// Double SHA-256, the hash used for txids, merkle nodes, and header hashes.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Reverse a 32-byte hash between wire order and display order.
pub fn swap_endian_32(mut hash: [u8; 32]) -> [u8; 32] {
    hash.reverse();
    hash
}

/// Parse a 64-character hex string into a 32-byte display-order hash.
pub fn hash_from_hex(s: &str) -> Result<[u8; 32], hex::FromHexError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out)?;
    Ok(out)
}

/// Hex-encode a display-order hash.
pub fn hash_to_hex(hash: &[u8; 32]) -> String {
    hex::encode(hash)
}
