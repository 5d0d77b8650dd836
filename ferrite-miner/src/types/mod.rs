//! Small value types shared across the mining pipeline.

mod extranonce;
mod hashrate;

pub use extranonce::{Extranonce1, Extranonce2, Extranonce2Range, ExtranonceError};
pub use hashrate::HashRate;
