//! Domain layer - Core identity types, naming rules and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod naming;
pub mod ports;

pub use ports::*;
