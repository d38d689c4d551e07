//! Control Plane Module
//!
//! The orchestrator that turns host volume lifecycle requests into ordered
//! sequences of array calls, with compensating rollback when a step fails.

pub mod connection;
pub mod orchestrator;
pub mod replication;
pub mod rollback;
pub mod stats;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ResolvedHandle, VolumeTarget};
pub use orchestrator::*;
pub use rollback::{CleanupFailure, Rollback};
pub use stats::{oversubscription_ratio, VolumeStats};
