//! Domain Ports - Core trait definitions for the K2 orchestrator
//!
//! These traits define the boundaries between the orchestration logic and
//! external systems: the array's management API on one side and the local
//! block-device attach/copy utility on the other. The plain types in this
//! module are the identity objects the host framework hands us.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extra-spec selecting dedup or nodedup provisioning
pub const THIN_PROV_TYPE_SPEC: &str = "kaminario:thin_prov_type";

/// Extra-spec requesting asynchronous replication
pub const REPLICATION_SPEC: &str = "kaminario:replication";

// =============================================================================
// Management API Requests
// =============================================================================

/// HTTP method used against the management API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Patch => write!(f, "PATCH"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single call against the array's management API
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path below the API root, e.g. `/volumes` or `/volumes/12`
    pub path: String,
    /// Field filters for searches
    pub query: Vec<(String, String)>,
    /// JSON payload for create and update
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Patch,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }
}

impl std::fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

// =============================================================================
// Array Transport Port
// =============================================================================

/// Port for the raw management API transport.
///
/// Implementations are not required to be safe for concurrent use; the
/// resilient client serializes every call to one endpoint.
#[async_trait]
pub trait ArrayTransport: Send + Sync {
    /// Send one request and return the decoded JSON body.
    ///
    /// Non-success HTTP statuses must surface as
    /// [`Error::Http`](crate::error::Error::Http) carrying the response text.
    async fn send(&self, request: &ApiRequest) -> Result<Value>;

    /// Management address this transport talks to
    fn endpoint(&self) -> &str;
}

// =============================================================================
// Host Identity Types
// =============================================================================

/// Storage protocol used to expose volumes to hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Iscsi,
    Fc,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Iscsi => write!(f, "iSCSI"),
            Protocol::Fc => write!(f, "FC"),
        }
    }
}

/// Volume type with its extra-specs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeType {
    pub name: String,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl VolumeType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra_specs: BTreeMap::new(),
        }
    }

    pub fn with_spec(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_specs.insert(key.into(), value.into());
        self
    }

    pub fn thin_prov_type(&self) -> Option<&str> {
        self.extra_specs.get(THIN_PROV_TYPE_SPEC).map(String::as_str)
    }

    /// Whether the type asks for replication
    pub fn replication_requested(&self) -> bool {
        self.extra_specs
            .get(REPLICATION_SPEC)
            .is_some_and(|v| v == "enabled")
    }
}

/// Replication status of a host volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationStatus {
    #[default]
    Disabled,
    Enabled,
    FailedOver,
    Error,
}

/// Volume as known to the host framework
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVolume {
    /// Stable identifier every array-side name is derived from
    pub id: String,
    /// Size in GiB
    pub size_gib: u64,
    #[serde(default)]
    pub volume_type: Option<VolumeType>,
    #[serde(default)]
    pub replication_status: ReplicationStatus,
}

impl HostVolume {
    pub fn new(id: impl Into<String>, size_gib: u64) -> Self {
        Self {
            id: id.into(),
            size_gib,
            volume_type: None,
            replication_status: ReplicationStatus::Disabled,
        }
    }

    pub fn with_type(mut self, volume_type: VolumeType) -> Self {
        self.volume_type = Some(volume_type);
        self
    }

    pub fn with_replication_status(mut self, status: ReplicationStatus) -> Self {
        self.replication_status = status;
        self
    }

    pub fn is_failed_over(&self) -> bool {
        self.replication_status == ReplicationStatus::FailedOver
    }
}

/// Snapshot as known to the host framework
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub id: String,
    /// Id of the volume the snapshot was taken from
    pub volume_id: String,
    /// Size of that volume in GiB
    pub volume_size_gib: u64,
}

/// Initiator description of a host asking for access
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub host: String,
    /// iSCSI initiator IQN
    #[serde(default)]
    pub initiator: Option<String>,
    /// Fibre Channel port WWNs
    #[serde(default)]
    pub wwpns: Vec<String>,
}

/// Reference to a pre-existing array volume to adopt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingRef {
    #[serde(rename = "source-name")]
    pub source_name: String,
}

/// Per-volume outcome of a failover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeUpdateStatus {
    FailedOver,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUpdate {
    pub volume_id: String,
    pub status: VolumeUpdateStatus,
}

/// Result of a retype request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetypeOutcome {
    /// The volume now matches the new type
    Retyped,
    /// Nothing had to change on the array
    Unchanged,
    /// dedup and nodedup cannot be converted in place; migrate instead
    MigrationRequired,
}

/// Result of mapping a volume or view to a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingInfo {
    pub lun: u32,
    pub host_name: String,
    pub object_name: String,
    pub protocol: Protocol,
}

// =============================================================================
// Device Connector Port
// =============================================================================

/// Locally attached block device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub path: String,
    pub mapping: MappingInfo,
}

/// Port for attaching mapped LUNs to this node and copying between them
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Connector properties describing this node
    fn local_connector(&self) -> Connector;

    /// Attach a mapped LUN as a local block device
    async fn attach(&self, mapping: &MappingInfo) -> Result<AttachedDevice>;

    /// Detach a previously attached device
    async fn detach(&self, device: &AttachedDevice) -> Result<()>;

    /// Copy `size_bytes` from `source` to `destination` in `block_size` chunks
    async fn copy(
        &self,
        source: &AttachedDevice,
        destination: &AttachedDevice,
        size_bytes: u64,
        block_size: u64,
    ) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ArrayTransportRef = Arc<dyn ArrayTransport>;
pub type DeviceConnectorRef = Arc<dyn DeviceConnector>;
