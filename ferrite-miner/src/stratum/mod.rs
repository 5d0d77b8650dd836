//! Stratum v1 wire protocol and server task.
//!
//! The protocol is line-delimited JSON over a plain TCP stream: clients
//! subscribe, authorize, and submit shares; the server pushes unsolicited
//! `mining.notify` jobs. Job state is read-mostly and broadcast through a
//! watch channel, so publishing a new job never blocks connections
//! mid-write, and a connection that misses an update simply serves the next
//! one.

pub mod messages;
pub mod pool;
pub mod server;

pub use messages::{Notification, Request, StratumError, SubmitParams};
pub use pool::PoolSupervisor;
pub use server::{AcceptedShare, PoolState, serve};
