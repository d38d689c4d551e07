//! Volume Lifecycle
//!
//! Every host volume lives in its own volume group on the source array.
//! Creation makes the group and then the volume; deletion removes them in
//! the opposite order. Clones and volumes created from snapshots are filled
//! by attaching both sides to this node and copying the data through the
//! device connector.

use crate::controlplane::connection::{ResolvedHandle, VolumeTarget};
use crate::controlplane::replication::ReplicaScope;
use crate::controlplane::rollback::{failed, Rollback};
use crate::controlplane::Orchestrator;
use crate::domain::naming;
use crate::domain::ports::{
    AttachedDevice, Connector, ExistingRef, HostSnapshot, HostVolume, RetypeOutcome, VolumeType,
};
use crate::error::{Error, ManageRejection, Result};
use crate::k2::locator::Filter;
use crate::k2::objects::{
    K2Resource, Mapping, NewSnapshot, NewVolume, NewVolumeGroup, RetentionPolicy, Snapshot, Volume,
    VolumeGroup, KIB_PER_GIB, STANDARD_RETENTION_POLICY,
};
use serde_json::json;
use tracing::{debug, error, info};

const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Volume size in the array's unit
fn size_in_kib(vol_name: &str, size_gib: u64) -> Result<u64> {
    size_gib.checked_mul(KIB_PER_GIB).ok_or_else(|| {
        Error::Configuration(format!("size of {} GiB for {} is out of range", size_gib, vol_name))
    })
}

/// Which steps of a data transfer have completed
#[derive(Default)]
struct Transfer {
    source: Option<AttachedDevice>,
    destination: Option<AttachedDevice>,
    destination_created: bool,
}

impl Orchestrator {
    // =========================================================================
    // Create / Delete / Extend
    // =========================================================================

    /// Create the volume group and volume backing a host volume, and its
    /// replica when the volume type asks for one
    pub async fn create_volume(&self, volume: &HostVolume) -> Result<()> {
        let replicated = self.is_replicated(volume.volume_type.as_ref());

        let vg_name = naming::volume_group_name(&volume.id);
        let vol_name = naming::volume_name(&volume.id);
        let is_dedup = self.is_dedup(volume.volume_type.as_ref());
        let size = size_in_kib(&vol_name, volume.size_gib)?;
        let client = self.endpoints.source();

        info!(
            "Creating volume group {} (quota: unlimited, dedup: {})",
            vg_name, is_dedup
        );
        let vg = client
            .create(&NewVolumeGroup {
                name: vg_name.clone(),
                quota: 0,
                is_dedup,
            })
            .await
            .map_err(|e| failed("create_volume", &vol_name, e))?;

        info!("Creating volume {} of {} GiB in {}", vol_name, volume.size_gib, vg_name);
        let vol = match client
            .create(&NewVolume {
                name: vol_name.clone(),
                size,
                volume_group: vg.reference(),
            })
            .await
        {
            Ok(vol) => vol,
            Err(e) => {
                let mut rollback = Rollback::new("create_volume", &vol_name, &self.metrics);
                rollback.attempt("delete volume group", client.delete(&vg)).await;
                return Err(rollback.finish(e));
            }
        };

        if replicated {
            self.create_volume_replica(volume, &vg, &vol, ReplicaScope::WithBaseVolume)
                .await?;
        }
        Ok(())
    }

    /// Delete a host volume, its replica and its group. Missing objects
    /// are skipped so an interrupted delete can be repeated.
    pub async fn delete_volume(&self, volume: &HostVolume) -> Result<()> {
        let vg_name = naming::volume_group_name(&volume.id);
        let vol_name = naming::volume_name(&volume.id);

        if self.is_replicated(volume.volume_type.as_ref()) {
            self.delete_volume_replica(volume).await?;
        }

        info!("Deleting volume {} and volume group {}", vol_name, vg_name);
        let client = self.endpoints.source();
        let result = async {
            if let Some(vol) = client.find_by_name::<Volume>(&vol_name).await? {
                client.delete(&vol).await?;
            }
            if let Some(vg) = client.find_by_name::<VolumeGroup>(&vg_name).await? {
                client.delete(&vg).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        result.map_err(|e| failed("delete_volume", &vol_name, e))
    }

    pub async fn extend_volume(&self, volume: &HostVolume, new_size_gib: u64) -> Result<()> {
        let vol_name = naming::volume_name(&volume.id);
        let size = size_in_kib(&vol_name, new_size_gib)?;
        let client = self.endpoints.source();
        let vol = client.require::<Volume>(&vol_name).await?;

        info!("Extending volume {} to {} GiB", vol_name, new_size_gib);
        client
            .update::<Volume>(vol.id, json!({ "size": size }))
            .await
            .map_err(|e| failed("extend_volume", &vol_name, e))?;
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot the volume group of the snapshot's volume
    pub async fn create_snapshot(&self, snapshot: &HostSnapshot) -> Result<()> {
        let vg_name = naming::volume_group_name(&snapshot.volume_id);
        let snap_name = naming::snapshot_name(&snapshot.id);
        let client = self.endpoints.source();

        let policy = self.retention_policy().await?;
        let vg = client.require::<VolumeGroup>(&vg_name).await?;

        info!("Creating snapshot {} of {}", snap_name, vg_name);
        client
            .create(&NewSnapshot {
                short_name: snap_name.clone(),
                source: vg.reference(),
                retention_policy: policy.reference(),
                is_exposable: None,
                is_auto_deleteable: Some(false),
            })
            .await
            .map_err(|e| failed("create_snapshot", &snap_name, e))?;
        Ok(())
    }

    pub async fn delete_snapshot(&self, snapshot: &HostSnapshot) -> Result<()> {
        let snap_name = naming::snapshot_name(&snapshot.id);
        info!("Deleting snapshot {}", snap_name);
        self.endpoints
            .source()
            .delete_by_name::<Snapshot>(&snap_name)
            .await
            .map_err(|e| failed("delete_snapshot", &snap_name, e))?;
        Ok(())
    }

    async fn retention_policy(&self) -> Result<RetentionPolicy> {
        self.endpoints
            .source()
            .require::<RetentionPolicy>(STANDARD_RETENTION_POLICY)
            .await
    }

    // =========================================================================
    // Clone / From Snapshot
    // =========================================================================

    /// Create `volume` as a copy of `source`. The source must not be
    /// attached anywhere.
    pub async fn create_cloned_volume(&self, volume: &HostVolume, source: &HostVolume) -> Result<()> {
        let clone_name = naming::volume_name(&volume.id);
        let src_name = naming::volume_name(&source.id);
        let client = self.endpoints.source();

        let src_vol = client.require::<Volume>(&src_name).await?;
        let mapped = client
            .count::<Mapping>(&Filter::new().reference("volume", &src_vol.reference()))
            .await?;
        if mapped != 0 {
            error!("Volume {} is attached and cannot be cloned", src_name);
            return Err(Error::AttachedVolumeClone { volume: src_name });
        }
        let connector = self.device()?.local_connector();

        info!("Cloning {} into {}", src_name, clone_name);
        let mut transfer = Transfer::default();
        let result = self
            .transfer(
                VolumeTarget::Identifier(source),
                volume,
                source.size_gib,
                &connector,
                &mut transfer,
            )
            .await;

        if let Err(e) = result {
            let mut rollback = Rollback::new("create_cloned_volume", &clone_name, &self.metrics);
            rollback
                .attempt(
                    "detach source volume",
                    self.detach(transfer.source.take(), source.into(), &connector),
                )
                .await;
            rollback
                .attempt(
                    "detach cloned volume",
                    self.detach(transfer.destination.take(), volume.into(), &connector),
                )
                .await;
            if transfer.destination_created {
                rollback
                    .attempt("delete cloned volume", self.delete_volume(volume))
                    .await;
            }
            return Err(rollback.finish(e));
        }
        Ok(())
    }

    /// Create `volume` from a snapshot through a temporary exposable view
    pub async fn create_volume_from_snapshot(
        &self,
        volume: &HostVolume,
        snapshot: &HostSnapshot,
    ) -> Result<()> {
        let vol_name = naming::volume_name(&volume.id);
        let snap_name = naming::snapshot_name(&snapshot.id);
        let view_name = naming::view_name(&volume.id);
        let client = self.endpoints.source();

        let policy = self.retention_policy().await?;
        let snap = client.require::<Snapshot>(&snap_name).await?;
        let connector = self.device()?.local_connector();

        info!("Creating view {} of snapshot {}", view_name, snap_name);
        let view = client
            .create(&NewSnapshot {
                short_name: view_name.clone(),
                source: snap.reference(),
                retention_policy: policy.reference(),
                is_exposable: Some(true),
                is_auto_deleteable: None,
            })
            .await
            .map_err(|e| failed("create_volume_from_snapshot", &vol_name, e))?;
        let handle = ResolvedHandle::from(&view);

        let mut transfer = Transfer::default();
        let result = async {
            self.transfer(
                VolumeTarget::Resolved(&handle),
                volume,
                snapshot.volume_size_gib,
                &connector,
                &mut transfer,
            )
            .await?;
            debug!("Deleting view {}", view_name);
            client.delete(&view).await
        }
        .await;

        if let Err(e) = result {
            let mut rollback =
                Rollback::new("create_volume_from_snapshot", &vol_name, &self.metrics);
            rollback
                .attempt(
                    "detach view",
                    self.detach(transfer.source.take(), (&handle).into(), &connector),
                )
                .await;
            rollback
                .attempt(
                    "detach volume",
                    self.detach(transfer.destination.take(), volume.into(), &connector),
                )
                .await;
            rollback
                .attempt("delete view", client.delete_by_name::<Snapshot>(&view_name))
                .await;
            if transfer.destination_created {
                rollback.attempt("delete volume", self.delete_volume(volume)).await;
            }
            return Err(rollback.finish(e));
        }
        Ok(())
    }

    /// Attach `source`, create and attach `destination`, copy, detach both.
    /// Progress is recorded in `transfer` for the caller's rollback.
    async fn transfer(
        &self,
        source: VolumeTarget<'_>,
        destination: &HostVolume,
        size_gib: u64,
        connector: &Connector,
        transfer: &mut Transfer,
    ) -> Result<()> {
        let device = self.device()?;

        let mapping = self.initialize_connection(source, connector).await?;
        transfer.source = Some(device.attach(&mapping).await?);

        self.create_volume(destination).await?;
        transfer.destination_created = true;

        let mapping = self
            .initialize_connection(destination.into(), connector)
            .await?;
        transfer.destination = Some(device.attach(&mapping).await?);

        if let (Some(src), Some(dst)) = (&transfer.source, &transfer.destination) {
            debug!("Copying {} GiB from {} to {}", size_gib, src.path, dst.path);
            let bytes = size_gib.checked_mul(BYTES_PER_GIB).ok_or_else(|| {
                Error::Configuration(format!("copy of {} GiB is out of range", size_gib))
            })?;
            device
                .copy(
                    src,
                    dst,
                    bytes,
                    self.config.volume_dd_blocksize,
                )
                .await?;
        }

        self.detach(transfer.destination.take(), destination.into(), connector)
            .await?;
        self.detach(transfer.source.take(), source, connector).await?;
        Ok(())
    }

    /// Detach the local device, if any, and unmap the object
    async fn detach(
        &self,
        device: Option<AttachedDevice>,
        target: VolumeTarget<'_>,
        connector: &Connector,
    ) -> Result<()> {
        let detached = match &device {
            Some(attached) => self.device()?.detach(attached).await,
            None => Ok(()),
        };
        let unmapped = self.terminate_connection(target, connector).await;
        detached.and(unmapped)
    }

    // =========================================================================
    // Manage Existing
    // =========================================================================

    /// Adopt an array volume by renaming it and its group to the names
    /// derived from the host volume
    pub async fn manage_existing(&self, volume: &HostVolume, existing: &ExistingRef) -> Result<()> {
        let source_name = &existing.source_name;
        let vol_name = naming::volume_name(&volume.id);
        let vg_name = naming::volume_group_name(&volume.id);
        let is_dedup = self.is_dedup(volume.volume_type.as_ref());
        let client = self.endpoints.source();

        let reject = |reason: ManageRejection| Error::ManageExistingInvalid {
            name: source_name.clone(),
            reason,
        };

        let vol = client
            .find_by_name::<Volume>(source_name)
            .await?
            .ok_or_else(|| reject(ManageRejection::NotFound))?;
        let vg = client.resolve::<VolumeGroup>(&vol.volume_group).await?;

        if self.group_is_replicated(&vg).await? {
            return Err(reject(ManageRejection::Replicated));
        }
        let mapped = client
            .count::<Mapping>(&Filter::new().reference("volume", &vol.reference()))
            .await?;
        if mapped != 0 {
            return Err(reject(ManageRejection::Mapped));
        }
        if vg.is_dedup != is_dedup {
            return Err(reject(ManageRejection::DedupMismatch {
                requested: is_dedup,
                actual: vg.is_dedup,
            }));
        }

        info!("Managing {} as {} in {}", source_name, vol_name, vg_name);
        client
            .update::<VolumeGroup>(vg.id, json!({"name": vg_name}))
            .await
            .map_err(|e| failed("manage_existing", source_name, e))?;

        if let Err(e) = client
            .update::<Volume>(vol.id, json!({"name": vol_name}))
            .await
        {
            let mut rollback = Rollback::new("manage_existing", source_name, &self.metrics);
            rollback
                .attempt(
                    "restore volume group name",
                    client.update::<VolumeGroup>(vg.id, json!({"name": vg.name})),
                )
                .await;
            return Err(rollback.finish(e));
        }
        Ok(())
    }

    /// Size in whole GiB of an array volume that is about to be managed
    pub async fn manage_existing_get_size(&self, existing: &ExistingRef) -> Result<u64> {
        let vol = self
            .endpoints
            .source()
            .find_by_name::<Volume>(&existing.source_name)
            .await?
            .ok_or_else(|| Error::ManageExistingInvalid {
                name: existing.source_name.clone(),
                reason: ManageRejection::NotFound,
            })?;
        Ok(vol.size.div_ceil(KIB_PER_GIB))
    }

    // =========================================================================
    // Retype / Migration
    // =========================================================================

    /// Change the volume type in place where the array allows it
    pub async fn retype(
        &self,
        volume: &HostVolume,
        new_type: Option<&VolumeType>,
    ) -> Result<RetypeOutcome> {
        let vg_name = naming::volume_group_name(&volume.id);
        let old_dedup = self.is_dedup(volume.volume_type.as_ref());
        let new_dedup = self.is_dedup(new_type);
        let old_replicated = self.replica_status(&vg_name).await?;
        let new_replicated = self.is_replicated(new_type);

        if old_dedup != new_dedup {
            if old_replicated || new_replicated {
                return Err(Error::UnsupportedRetype {
                    volume: naming::volume_name(&volume.id),
                    reason: "dedup cannot change on a replicated volume".to_string(),
                });
            }
            info!("Retype of {} changes dedup, migration required", volume.id);
            return Ok(RetypeOutcome::MigrationRequired);
        }

        match (old_replicated, new_replicated) {
            (false, true) => {
                self.add_replication(volume).await?;
                Ok(RetypeOutcome::Retyped)
            }
            (true, false) => {
                self.remove_replication(volume).await?;
                Ok(RetypeOutcome::Retyped)
            }
            _ => Ok(RetypeOutcome::Unchanged),
        }
    }

    /// After a migration created `new_volume`, drop `volume` and give the
    /// migrated objects its names
    pub async fn update_migrated_volume(
        &self,
        volume: &HostVolume,
        new_volume: &HostVolume,
    ) -> Result<()> {
        let vol_name = naming::volume_name(&volume.id);
        let vg_name = naming::volume_group_name(&volume.id);
        let client = self.endpoints.source();

        self.delete_volume(volume).await?;

        let result = async {
            let new_vg = client
                .require::<VolumeGroup>(&naming::volume_group_name(&new_volume.id))
                .await?;
            client
                .update::<VolumeGroup>(new_vg.id, json!({"name": vg_name}))
                .await?;
            let new_vol = client
                .require::<Volume>(&naming::volume_name(&new_volume.id))
                .await?;
            client
                .update::<Volume>(new_vol.id, json!({"name": vol_name}))
                .await?;
            Ok::<(), Error>(())
        }
        .await;
        result.map_err(|e| failed("update_migrated_volume", &vol_name, e))
    }
}
