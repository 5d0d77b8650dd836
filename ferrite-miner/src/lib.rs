//! Ferrite turns a node's block template into a proof-of-work-valid block.
//!
//! The crate covers both ends of that pipeline: `ferrite-minerd` mines solo
//! against a node's `getblocktemplate`, and `ferrite-poold` distributes the
//! same work to remote workers over a minimal Stratum v1 protocol.
//!
//! Layering, leaves first:
//!
//! - [`encode`]: varint codec, double SHA-256, endianness helpers
//! - [`target`]: compact-bits ⇄ 256-bit target conversion and rescaling
//! - [`types`]: extranonce and hashrate value types
//! - [`template`]: typed model of the node's block template
//! - [`coinbase`]: coinbase transaction construction (BIP34, segwit)
//! - [`merkle`]: merkle root, branch extraction, branch folding
//! - [`header`]: 80-byte header and full block serialization
//! - [`pow`]: cancellable batched nonce search
//! - [`job`]: coinbase splitting, job assembly, share validation
//! - [`stratum`]: line-delimited JSON wire protocol and server task
//! - [`rpc`]: node RPC contract and reqwest client
//! - [`supervisor`]: mining cycle, search workers, aggregator, watchdog

pub mod artifacts;
pub mod coinbase;
pub mod config;
pub mod encode;
pub mod header;
pub mod job;
pub mod merkle;
pub mod pow;
pub mod rpc;
pub mod stratum;
pub mod supervisor;
pub mod target;
pub mod template;
pub mod types;
