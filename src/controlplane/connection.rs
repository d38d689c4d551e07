//! Host Connections
//!
//! Maps volumes and snapshot views to initiator hosts. The host object is
//! named after the connector's host name and created on first use with its
//! iSCSI IQN or FC port WWNs registered; it is removed again when its last
//! mapping goes away.
//!
//! Volumes whose replication status is failed-over live on the target array
//! under their replica name, so their mappings are made there.

use crate::controlplane::rollback::Rollback;
use crate::controlplane::Orchestrator;
use crate::domain::naming;
use crate::domain::ports::{Connector, HostVolume, MappingInfo, Protocol};
use crate::error::{Error, Result};
use crate::k2::locator::Filter;
use crate::k2::objects::{
    Host, K2Resource, Mapping, NewHost, NewHostFcPort, NewHostIqn, NewMapping, ObjRef, Snapshot,
    VolSnap, Volume,
};
use crate::k2::ResilientClient;
use tracing::{debug, info, warn};

/// Host type registered for initiators
const HOST_TYPE: &str = "Linux";

/// Array-side handle of an object that is not a host volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandle {
    pub reference: ObjRef,
    pub name: String,
}

impl From<&Snapshot> for ResolvedHandle {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            reference: snapshot.reference(),
            name: snapshot.short_name.clone(),
        }
    }
}

/// What to map: a host volume located by its identifier, or an object
/// that was already resolved on the source array (a snapshot view)
#[derive(Debug, Clone, Copy)]
pub enum VolumeTarget<'a> {
    Identifier(&'a HostVolume),
    Resolved(&'a ResolvedHandle),
}

impl<'a> From<&'a HostVolume> for VolumeTarget<'a> {
    fn from(volume: &'a HostVolume) -> Self {
        VolumeTarget::Identifier(volume)
    }
}

impl<'a> From<&'a ResolvedHandle> for VolumeTarget<'a> {
    fn from(handle: &'a ResolvedHandle) -> Self {
        VolumeTarget::Resolved(handle)
    }
}

impl Orchestrator {
    /// Endpoint and array name of a host volume
    pub(crate) fn locate_volume(&self, volume: &HostVolume) -> Result<(&ResilientClient, String)> {
        let name = naming::volume_name(&volume.id);
        if volume.is_failed_over() {
            Ok((self.endpoints.target()?, naming::replication_name(&name)))
        } else {
            Ok((self.endpoints.source(), name))
        }
    }

    /// Map a volume or view to the connector's host
    pub async fn initialize_connection(
        &self,
        target: VolumeTarget<'_>,
        connector: &Connector,
    ) -> Result<MappingInfo> {
        let (client, object, object_name, is_view) = match target {
            VolumeTarget::Identifier(volume) => {
                let (client, name) = self.locate_volume(volume)?;
                let vol = client.require::<Volume>(&name).await?;
                (client, vol.reference(), name, false)
            }
            VolumeTarget::Resolved(handle) => (
                self.endpoints.source(),
                handle.reference.clone(),
                handle.name.clone(),
                true,
            ),
        };

        let host_name = naming::initiator_host_name(&connector.host);
        let (host, created) = self.get_or_create_host(client, &host_name, connector).await?;

        info!("Mapping {} to host {} on K2 {}", object_name, host_name, client.label());
        let mapping = match client
            .create(&NewMapping {
                volume: object.clone(),
                host: host.reference(),
            })
            .await
        {
            Ok(mapping) => mapping,
            Err(e) => {
                let mut rollback = Rollback::new("initialize_connection", &object_name, &self.metrics);
                if created {
                    rollback.attempt("delete host", client.delete(&host)).await;
                }
                return Err(rollback.finish(e));
            }
        };

        let lun = if is_view {
            view_lun(client, &object, &host).await?
        } else {
            mapping.lun
        };

        Ok(MappingInfo {
            lun,
            host_name,
            object_name,
            protocol: self.config.protocol,
        })
    }

    /// Remove the mapping of a volume or view, and the host once unused
    pub async fn terminate_connection(
        &self,
        target: VolumeTarget<'_>,
        connector: &Connector,
    ) -> Result<()> {
        let (client, object, object_name) = match target {
            VolumeTarget::Identifier(volume) => {
                let (client, name) = self.locate_volume(volume)?;
                let object = client
                    .find_by_name::<Volume>(&name)
                    .await?
                    .map(|vol| vol.reference());
                (client, object, name)
            }
            VolumeTarget::Resolved(handle) => {
                let client = self.endpoints.source();
                let volsnap = client
                    .find::<VolSnap>(&Filter::new().reference("snapshot", &handle.reference))
                    .await?;
                let object = volsnap
                    .map(|v| v.reference())
                    .unwrap_or_else(|| handle.reference.clone());
                (client, Some(object), handle.name.clone())
            }
        };

        let host_name = naming::initiator_host_name(&connector.host);
        let Some(host) = client.find_by_name::<Host>(&host_name).await? else {
            warn!("Host {} not found on K2 {}", host_name, client.label());
            return Ok(());
        };
        let Some(object) = object else {
            debug!("{} is not on K2 {}, nothing to unmap", object_name, client.label());
            return Ok(());
        };

        let mapping = client
            .find::<Mapping>(
                &Filter::new()
                    .reference("volume", &object)
                    .reference("host", &host.reference()),
            )
            .await?;
        if let Some(mapping) = mapping {
            info!("Unmapping {} from host {}", object_name, host_name);
            client.delete(&mapping).await?;
        }

        let remaining = client
            .count::<Mapping>(&Filter::new().reference("host", &host.reference()))
            .await?;
        if remaining == 0 {
            info!("Deleting host {} without mappings", host_name);
            client.delete(&host).await?;
        }
        Ok(())
    }

    /// Find the host by name, or create it with its initiators registered.
    /// The flag tells whether this call created it.
    async fn get_or_create_host(
        &self,
        client: &ResilientClient,
        host_name: &str,
        connector: &Connector,
    ) -> Result<(Host, bool)> {
        if let Some(host) = client.find_by_name::<Host>(host_name).await? {
            return Ok((host, false));
        }

        info!("Creating host {} on K2 {}", host_name, client.label());
        let host = client
            .create(&NewHost {
                name: host_name.to_string(),
                host_type: HOST_TYPE.to_string(),
            })
            .await?;

        if let Err(e) = self.register_initiators(client, &host, connector).await {
            let mut rollback = Rollback::new("create_host", host_name, &self.metrics);
            rollback.attempt("delete host", client.delete(&host)).await;
            return Err(rollback.finish(e));
        }
        Ok((host, true))
    }

    async fn register_initiators(
        &self,
        client: &ResilientClient,
        host: &Host,
        connector: &Connector,
    ) -> Result<()> {
        match self.config.protocol {
            Protocol::Iscsi => {
                let iqn = connector.initiator.as_ref().ok_or_else(|| {
                    Error::Configuration(format!("connector of {} has no iSCSI initiator", connector.host))
                })?;
                debug!("Registering IQN {} for host {}", iqn, host.name);
                client
                    .create(&NewHostIqn {
                        iqn: iqn.clone(),
                        host: host.reference(),
                    })
                    .await?;
            }
            Protocol::Fc => {
                if connector.wwpns.is_empty() {
                    return Err(Error::Configuration(format!(
                        "connector of {} has no FC ports",
                        connector.host
                    )));
                }
                for wwpn in &connector.wwpns {
                    debug!("Registering WWPN {} for host {}", wwpn, host.name);
                    client
                        .create(&NewHostFcPort {
                            pwwn: wwpn.clone(),
                            host: host.reference(),
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// LUN of a view: its mapping hangs off the volsnap exposing the snapshot
async fn view_lun(client: &ResilientClient, snapshot: &ObjRef, host: &Host) -> Result<u32> {
    let volsnap = client
        .find::<VolSnap>(&Filter::new().reference("snapshot", snapshot))
        .await?
        .ok_or_else(|| Error::not_found(VolSnap::KIND, snapshot.to_string()))?;
    let mapping = client
        .find::<Mapping>(
            &Filter::new()
                .reference("volume", &volsnap.reference())
                .reference("host", &host.reference()),
        )
        .await?
        .ok_or_else(|| Error::not_found(Mapping::KIND, volsnap.reference().to_string()))?;
    Ok(mapping.lun)
}
