//! Weight synchronization between trainer and engine pool.
//!
//! This module provides:
//! - [`snapshot::WeightSnapshot`] -- the versioned unit of transfer, with a
//!   content digest and CBOR encoding.
//! - [`transport::SyncTransport`] -- collective (shared memory) vs
//!   serialized (encode once, ship bytes) delivery.
//! - [`synchronizer::WeightSynchronizer`] -- the sequential broadcast with
//!   per-engine ack timeouts and pool health bookkeeping.

pub mod snapshot;
pub mod synchronizer;
pub mod transport;

// Re-export the most commonly used items at the module level.
pub use snapshot::{WeightShard, WeightSnapshot};
pub use synchronizer::{SyncReport, WeightSynchronizer};
pub use transport::{PreparedUpdate, SyncTransport};
