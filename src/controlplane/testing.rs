//! Test fixtures shared by the orchestration tests

use crate::config::{DriverConfig, ReplicaConfig, RetryConfig, TeardownConfig};
use crate::controlplane::Orchestrator;
use crate::domain::ports::{
    ArrayTransportRef, AttachedDevice, Connector, DeviceConnector, MappingInfo, VolumeType,
    REPLICATION_SPEC, THIN_PROV_TYPE_SPEC,
};
use crate::error::{Error, Result};
use crate::k2::fake::FakeArray;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) const TARGET_ARRAY: &str = "k2-target";

pub(crate) fn base_config() -> DriverConfig {
    DriverConfig {
        san_ip: "k2-source".into(),
        san_login: "admin".into(),
        san_password: "secret".into(),
        retry: RetryConfig {
            initial_interval_ms: 1,
            multiplier: 1.0,
        },
        teardown: TeardownConfig {
            poll_interval_ms: 1,
            timeout_secs: 5,
        },
        ..Default::default()
    }
}

pub(crate) fn replicated_type() -> VolumeType {
    VolumeType::new("gold").with_spec(REPLICATION_SPEC, "enabled")
}

pub(crate) fn nodedup_type() -> VolumeType {
    VolumeType::new("bronze").with_spec(THIN_PROV_TYPE_SPEC, "nodedup")
}

/// Device connector that attaches nothing and records what it did
#[derive(Default)]
pub(crate) struct FakeDevice {
    attached: Mutex<Vec<String>>,
    copies: Mutex<Vec<(String, String, u64)>>,
    fail_copy: AtomicBool,
}

impl FakeDevice {
    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().clone()
    }

    pub fn copies(&self) -> Vec<(String, String, u64)> {
        self.copies.lock().clone()
    }

    pub fn fail_copies(&self) {
        self.fail_copy.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceConnector for FakeDevice {
    fn local_connector(&self) -> Connector {
        Connector {
            host: "node-1.example.com".into(),
            initiator: Some("iqn.1993-08.org.debian:01:node1".into()),
            wwpns: Vec::new(),
        }
    }

    async fn attach(&self, mapping: &MappingInfo) -> Result<AttachedDevice> {
        let path = format!("/dev/k2/{}", mapping.object_name);
        self.attached.lock().push(path.clone());
        Ok(AttachedDevice {
            path,
            mapping: mapping.clone(),
        })
    }

    async fn detach(&self, device: &AttachedDevice) -> Result<()> {
        self.attached.lock().retain(|p| p != &device.path);
        Ok(())
    }

    async fn copy(
        &self,
        source: &AttachedDevice,
        destination: &AttachedDevice,
        size_bytes: u64,
        _block_size: u64,
    ) -> Result<()> {
        if self.fail_copy.load(Ordering::SeqCst) {
            return Err(Error::Device("copy interrupted".into()));
        }
        self.copies.lock().push((
            source.mapping.object_name.clone(),
            destination.mapping.object_name.clone(),
            size_bytes,
        ));
        Ok(())
    }
}

/// Orchestrator wired to fake arrays and a fake device connector
pub(crate) struct Harness {
    pub orchestrator: Orchestrator,
    pub source: Arc<FakeArray>,
    pub target: Arc<FakeArray>,
    pub device: Arc<FakeDevice>,
}

impl Harness {
    /// Backend without replication
    pub fn single() -> Self {
        Self::build(base_config(), None)
    }

    /// Backend replicating to a peer whose session state lags by `lag` reads
    pub fn replicated(lag: u32) -> Self {
        let mut config = base_config();
        config.replication_device = Some(ReplicaConfig {
            backend_id: TARGET_ARRAY.into(),
            login: "admin".into(),
            password: "secret".into(),
            rpo: 60,
        });
        Self::build(config, Some(lag))
    }

    pub fn with_config(config: DriverConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: DriverConfig, lag: Option<u32>) -> Self {
        let source = FakeArray::new("k2-source");
        let target = FakeArray::new(TARGET_ARRAY);
        let device = Arc::new(FakeDevice::default());

        let target_transport = lag.map(|lag| {
            source.link_peer(&target, lag);
            target.clone() as ArrayTransportRef
        });
        let orchestrator = Orchestrator::new(config, source.clone(), target_transport)
            .expect("orchestrator")
            .with_device_connector(device.clone());

        Self {
            orchestrator,
            source,
            target,
            device,
        }
    }
}
