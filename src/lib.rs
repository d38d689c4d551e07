//! K2 Orchestrator
//!
//! Volume lifecycle and replication orchestration for K2 all-flash arrays,
//! driven through the arrays' management REST API.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Orchestrator                              │
//! │  ┌────────────┐ ┌──────────────┐ ┌─────────────┐ ┌────────────────┐  │
//! │  │  Volumes   │ │ Replication  │ │ Connections │ │ Capacity Stats │  │
//! │  └─────┬──────┘ └──────┬───────┘ └──────┬──────┘ └───────┬────────┘  │
//! │        └───────────────┴───── Rollback ledger ───────────┘           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │          Object Locator (search, find, require, delete_matching)     │
//! ├───────────────────────────────────┬──────────────────────────────────┤
//! │   Resilient Client: source array  │  Resilient Client: target array  │
//! │   (endpoint lock, busy retries)   │  (endpoint lock, busy retries)   │
//! ├───────────────────────────────────┴──────────────────────────────────┤
//! │                 HTTPS transport (/api/v2, basic auth)                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator and its lifecycle operations
//! - [`k2`]: Array object model, transport, resilient client and locator
//! - [`domain`]: Name derivation and host-side types and ports
//! - [`config`]: Driver configuration
//! - [`metrics`]: Prometheus counters
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod k2;
pub mod metrics;

// Re-export commonly used types
pub use config::{DriverConfig, ReplicaConfig, RetryConfig, TeardownConfig};

pub use controlplane::{Orchestrator, ResolvedHandle, VolumeStats, VolumeTarget, K2_MIN_VERSION};

pub use domain::ports::{
    ArrayTransport, AttachedDevice, Connector, DeviceConnector, ExistingRef, HostSnapshot,
    HostVolume, MappingInfo, Protocol, ReplicationStatus, RetypeOutcome, VolumeType,
    VolumeUpdate, VolumeUpdateStatus,
};

pub use error::{Error, ManageRejection, Result};

pub use k2::{Endpoints, HttpTransport, HttpTransportConfig, ResilientClient};

pub use metrics::DriverMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
