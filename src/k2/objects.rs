//! K2 Array Object Model
//!
//! Typed views of the resource collections exposed by the K2 management
//! API. Objects reference each other through [`ObjRef`] values of the form
//! `{"ref": "/volume_groups/12"}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Size unit the array uses for volumes and capacity counters (KiB)
pub const KIB_PER_GIB: u64 = 1024 * 1024;

/// Name of the retention policy used for snapshots and views
pub const STANDARD_RETENTION_POLICY: &str = "Best_Effort_Retention";

// =============================================================================
// References
// =============================================================================

/// Reference from one array object to another
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjRef {
    #[serde(rename = "ref")]
    pub path: String,
}

impl ObjRef {
    pub fn new(collection: &str, id: u64) -> Self {
        Self {
            path: format!("/{collection}/{id}"),
        }
    }

    /// Collection part of the reference
    pub fn collection(&self) -> &str {
        self.path
            .trim_start_matches('/')
            .rsplit_once('/')
            .map(|(collection, _)| collection)
            .unwrap_or("")
    }

    pub fn id(&self) -> Option<u64> {
        self.path.rsplit_once('/').and_then(|(_, id)| id.parse().ok())
    }
}

impl std::fmt::Display for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

// =============================================================================
// Resource Trait
// =============================================================================

/// A resource living in one collection of the management API
pub trait K2Resource: DeserializeOwned + Send + Sync {
    /// Collection path below the API root
    const COLLECTION: &'static str;
    /// Human readable kind used in errors and logs
    const KIND: &'static str;
    /// Field holding the object's name
    const NAME_FIELD: &'static str = "name";

    fn id(&self) -> u64;

    fn reference(&self) -> ObjRef {
        ObjRef::new(Self::COLLECTION, self.id())
    }

    fn path(&self) -> String {
        format!("/{}/{}", Self::COLLECTION, self.id())
    }
}

/// Payload creating a resource of type [`NewResource::Created`]
pub trait NewResource: Serialize + Send + Sync {
    type Created: K2Resource;
}

macro_rules! k2_resource {
    ($ty:ty, $collection:expr, $kind:expr) => {
        impl K2Resource for $ty {
            const COLLECTION: &'static str = $collection;
            const KIND: &'static str = $kind;

            fn id(&self) -> u64 {
                self.id
            }
        }
    };
    ($ty:ty, $collection:expr, $kind:expr, $name_field:expr) => {
        impl K2Resource for $ty {
            const COLLECTION: &'static str = $collection;
            const KIND: &'static str = $kind;
            const NAME_FIELD: &'static str = $name_field;

            fn id(&self) -> u64 {
                self.id
            }
        }
    };
}

// =============================================================================
// System
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub id: u64,
    pub rest_api_version: String,
}
k2_resource!(SystemState, "system/state", "system state");

/// Array-wide capacity counters, all in KiB
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemCapacity {
    pub id: u64,
    pub free: u64,
    pub total: u64,
    #[serde(default)]
    pub provisioned: u64,
    #[serde(default)]
    pub provisioned_volumes: u64,
}
k2_resource!(SystemCapacity, "system/capacity", "system capacity");

// =============================================================================
// Volumes
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub quota: u64,
    #[serde(default = "default_true")]
    pub is_dedup: bool,
}
k2_resource!(VolumeGroup, "volume_groups", "volume group");

#[derive(Debug, Clone, Serialize)]
pub struct NewVolumeGroup {
    pub name: String,
    /// 0 means unlimited
    pub quota: u64,
    pub is_dedup: bool,
}

impl NewResource for NewVolumeGroup {
    type Created = VolumeGroup;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: u64,
    pub name: String,
    /// Size in KiB
    pub size: u64,
    pub volume_group: ObjRef,
}
k2_resource!(Volume, "volumes", "volume");

#[derive(Debug, Clone, Serialize)]
pub struct NewVolume {
    pub name: String,
    pub size: u64,
    pub volume_group: ObjRef,
}

impl NewResource for NewVolume {
    type Created = Volume;
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub short_name: String,
    pub source: ObjRef,
    #[serde(default)]
    pub volume_group: Option<ObjRef>,
    #[serde(default)]
    pub retention_policy: Option<ObjRef>,
    #[serde(default)]
    pub is_exposable: bool,
    #[serde(default)]
    pub is_auto_deleteable: bool,
}
k2_resource!(Snapshot, "snapshots", "snapshot", "short_name");

#[derive(Debug, Clone, Serialize)]
pub struct NewSnapshot {
    pub short_name: String,
    pub source: ObjRef,
    pub retention_policy: ObjRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_exposable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_auto_deleteable: Option<bool>,
}

impl NewResource for NewSnapshot {
    type Created = Snapshot;
}

/// Exposure object the array creates for an exposable snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolSnap {
    pub id: u64,
    pub snapshot: ObjRef,
}
k2_resource!(VolSnap, "volsnaps", "volsnap");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: u64,
    pub name: String,
}
k2_resource!(RetentionPolicy, "retention_policies", "retention policy");

// =============================================================================
// Hosts and Mappings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub host_type: String,
}
k2_resource!(Host, "hosts", "host");

#[derive(Debug, Clone, Serialize)]
pub struct NewHost {
    pub name: String,
    #[serde(rename = "type")]
    pub host_type: String,
}

impl NewResource for NewHost {
    type Created = Host;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIqn {
    pub id: u64,
    pub iqn: String,
    pub host: ObjRef,
}
k2_resource!(HostIqn, "host_iqns", "host iqn", "iqn");

#[derive(Debug, Clone, Serialize)]
pub struct NewHostIqn {
    pub iqn: String,
    pub host: ObjRef,
}

impl NewResource for NewHostIqn {
    type Created = HostIqn;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFcPort {
    pub id: u64,
    pub pwwn: String,
    pub host: ObjRef,
}
k2_resource!(HostFcPort, "host_fc_ports", "host fc port", "pwwn");

#[derive(Debug, Clone, Serialize)]
pub struct NewHostFcPort {
    pub pwwn: String,
    pub host: ObjRef,
}

impl NewResource for NewHostFcPort {
    type Created = HostFcPort;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub id: u64,
    pub volume: ObjRef,
    pub host: ObjRef,
    pub lun: u32,
}
k2_resource!(Mapping, "mappings", "mapping");

#[derive(Debug, Clone, Serialize)]
pub struct NewMapping {
    pub volume: ObjRef,
    pub host: ObjRef,
}

impl NewResource for NewMapping {
    type Created = Mapping;
}

// =============================================================================
// Replication
// =============================================================================

/// Remote array known to this one as a replication peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationPeer {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub mgmt_host: String,
}
k2_resource!(ReplicationPeer, "replication/peer_k2arrays", "replication peer");

/// Replication session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    InSync,
    Suspended,
    Idle,
    FailedOver,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Initializing => write!(f, "initializing"),
            SessionState::InSync => write!(f, "in_sync"),
            SessionState::Suspended => write!(f, "suspended"),
            SessionState::Idle => write!(f, "idle"),
            SessionState::FailedOver => write!(f, "failed_over"),
            SessionState::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSession {
    pub id: u64,
    pub name: String,
    pub state: SessionState,
    #[serde(default)]
    pub local_volume_group: Option<ObjRef>,
    #[serde(default)]
    pub replication_peer_k2array: Option<ObjRef>,
    #[serde(default)]
    pub replication_peer_volume_group_name: Option<String>,
    #[serde(default)]
    pub remote_replication_session_name: Option<String>,
    #[serde(default)]
    pub rpo: Option<u64>,
}
k2_resource!(ReplicationSession, "replication/sessions", "replication session");

#[derive(Debug, Clone, Serialize)]
pub struct NewReplicationSession {
    pub name: String,
    pub replication_peer_k2array: ObjRef,
    pub local_volume_group: ObjRef,
    pub replication_peer_volume_group_name: String,
    pub remote_replication_session_name: String,
    pub rpo: u64,
    /// The array expects the string form of the flag
    pub auto_configure_peer_volumes: String,
}

impl NewResource for NewReplicationSession {
    type Created = ReplicationSession;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerVolume {
    pub id: u64,
    pub name: String,
    pub local_volume: ObjRef,
    pub replication_session: ObjRef,
}
k2_resource!(PeerVolume, "replication/peer_volumes", "peer volume");

#[derive(Debug, Clone, Serialize)]
pub struct NewPeerVolume {
    pub name: String,
    pub local_volume: ObjRef,
    pub replication_session: ObjRef,
}

impl NewResource for NewPeerVolume {
    type Created = PeerVolume;
}

fn default_true() -> bool {
    true
}
