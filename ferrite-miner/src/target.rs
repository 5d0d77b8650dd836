//! Proof-of-work target with lossless 256-bit representation.
//!
//! The network encodes targets in the compact "bits" form, an 8-bit exponent
//! plus 24-bit significand. Both directions of that conversion live here,
//! along with the difficulty-factor rescaling used to mine regtest and
//! signet at a practical rate.

use std::cmp::Ordering;
use std::fmt;

use ruint::aliases::U256;
use thiserror::Error;

/// The difficulty-1 target, the largest target the network will accept.
///
/// In compact form this is 0x1d00ffff.
pub const POOL_MAX_BITS: u32 = 0x1d00ffff;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TargetError {
    #[error("difficulty factor must be > 0, got {0}")]
    InvalidFactor(f64),
}

/// A 256-bit proof-of-work target.
///
/// A header hash (read as a big-endian number in display order) satisfies
/// the target when it is numerically less than or equal to it. Smaller
/// target means higher difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(U256);

impl Target {
    pub const ZERO: Self = Self(U256::ZERO);
    pub const MAX: Self = Self(U256::MAX);

    /// Decode a compact "bits" value into the full target.
    ///
    /// target = significand << 8·(exponent − 3). Exponents large enough to
    /// shift the significand out of 256 bits saturate at `Target::MAX`.
    pub fn from_compact(bits: u32) -> Self {
        let exponent = (bits >> 24) as usize;
        let significand = U256::from(bits & 0x007f_ffff);

        let value = if exponent <= 3 {
            significand >> (8 * (3 - exponent))
        } else {
            match significand.checked_shl(8 * (exponent - 3)) {
                Some(v) => v,
                None => U256::MAX,
            }
        };

        Self(value)
    }

    /// Encode this target in compact form.
    ///
    /// Strips leading zero bytes, pads with one zero byte when the top bit
    /// of the leading retained byte is set (sign disambiguation), and keeps
    /// the three leading bytes as significand. Lossy below the significand;
    /// `from_compact(to_compact())` is stable after the first round-trip.
    pub fn to_compact(self) -> u32 {
        let bytes: [u8; 32] = self.0.to_be_bytes();

        let first_nonzero = match bytes.iter().position(|&b| b != 0) {
            Some(i) => i,
            None => return 0,
        };

        let mut exponent = (32 - first_nonzero) as u32;
        let mut significand: u32 = 0;
        for i in 0..3 {
            significand <<= 8;
            if first_nonzero + i < 32 {
                significand |= bytes[first_nonzero + i] as u32;
            }
        }

        if significand & 0x0080_0000 != 0 {
            significand >>= 8;
            exponent += 1;
        }

        (exponent << 24) | significand
    }

    /// Rescale the network maximum target by a difficulty factor.
    ///
    /// factor > 1 shrinks the target (harder), factor < 1 grows it
    /// (easier), saturating at the largest representable value. A factor
    /// of zero or below is a caller error, not a clamp.
    pub fn from_difficulty_factor(factor: f64) -> Result<Self, TargetError> {
        if !(factor > 0.0) || !factor.is_finite() {
            return Err(TargetError::InvalidFactor(factor));
        }

        // Scale the factor to a rational over 2^32 so the division stays in
        // integer arithmetic: max/factor == (max << 32) / (factor · 2^32).
        // The max target has 32 leading zero bits, so the shift is exact.
        let denominator = (factor * 4_294_967_296.0) as u128;
        if denominator == 0 {
            return Ok(Self::MAX);
        }

        let dividend = Self::from_compact(POOL_MAX_BITS)
            .0
            .checked_shl(32)
            .expect("difficulty-1 target has 32 leading zero bits");

        Ok(Self(dividend / U256::from(denominator)))
    }

    /// Whether a display-order digest satisfies this target.
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        U256::from_be_bytes(*hash) <= self.0
    }

    /// Approximate difficulty relative to the network maximum target.
    pub fn difficulty(&self) -> f64 {
        if self.0 == U256::ZERO {
            return f64::INFINITY;
        }
        approx_f64(Self::from_compact(POOL_MAX_BITS).0) / approx_f64(self.0)
    }

    /// The raw 256-bit value, big-endian.
    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(U256::from_be_bytes(bytes))
    }
}

/// Lossy f64 view of a 256-bit value, 8 significant bytes of precision.
fn approx_f64(value: U256) -> f64 {
    let bytes: [u8; 32] = value.to_be_bytes();
    let first = match bytes.iter().position(|&b| b != 0) {
        Some(i) => i,
        None => return 0.0,
    };

    let mut mantissa = 0u64;
    for i in 0..8 {
        mantissa = (mantissa << 8) | bytes.get(first + i).copied().unwrap_or(0) as u64;
    }

    mantissa as f64 * 2f64.powi(8 * (24 - first as i32))
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes::<32>()))
    }
}

/// Difficulty wrapper for human-readable logging with SI suffixes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Difficulty(pub f64);

impl Difficulty {
    pub fn of(target: &Target) -> Self {
        Self(target.difficulty())
    }
}

impl PartialOrd for Difficulty {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        if value < 1.0 {
            let s = format!("{:.6}", value);
            let trimmed = s.trim_end_matches('0').trim_end_matches('.');
            return write!(f, "{}", trimmed);
        }

        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}
