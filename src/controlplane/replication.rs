//! Replication
//!
//! A replicated volume has a session on each array: the source session
//! drives replication of the volume group into a peer group on the target.
//! Setup creates the session pair and the peer volume and moves the source
//! session to `in_sync`. Teardown walks the source session through
//! `suspended` and `idle`, each time waiting until the target session
//! reports the same state, before anything is deleted.

use crate::controlplane::rollback::{failed, Rollback};
use crate::controlplane::Orchestrator;
use crate::domain::naming;
use crate::domain::ports::{HostVolume, VolumeUpdate, VolumeUpdateStatus};
use crate::error::{Error, Result};
use crate::k2::locator::Filter;
use crate::k2::objects::{
    K2Resource, NewPeerVolume, NewReplicationSession, ReplicationPeer, ReplicationSession,
    SessionState, Snapshot, Volume, VolumeGroup,
};
use crate::k2::ResilientClient;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What a failed replica setup removes besides the replication objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplicaScope {
    /// The base volume was created for this replica; remove it too
    WithBaseVolume,
    /// The base volume predates the replica and stays
    SessionOnly,
}

/// Names of the objects making up one volume's replication
struct ReplicaNames {
    vg: String,
    vol: String,
    session: String,
    remote_vg: String,
    remote_vol: String,
    remote_session: String,
}

impl ReplicaNames {
    fn new(volume: &HostVolume) -> Self {
        let vg = naming::volume_group_name(&volume.id);
        let vol = naming::volume_name(&volume.id);
        let session = naming::session_name(&volume.id);
        Self {
            remote_vg: naming::replication_name(&vg),
            remote_vol: naming::replication_name(&vol),
            remote_session: naming::replication_name(&session),
            vg,
            vol,
            session,
        }
    }
}

impl Orchestrator {
    // =========================================================================
    // Setup
    // =========================================================================

    /// Replicate an existing volume group and volume to the target array.
    ///
    /// On failure every replication object is removed from both arrays, and
    /// with [`ReplicaScope::WithBaseVolume`] the base volume and group too.
    pub(crate) async fn create_volume_replica(
        &self,
        volume: &HostVolume,
        vg: &VolumeGroup,
        vol: &Volume,
        scope: ReplicaScope,
    ) -> Result<()> {
        let source = self.endpoints.source();
        let target = self.endpoints.target()?;
        let names = ReplicaNames::new(volume);

        if let Err(e) = self.establish_session(&names, vg, vol).await {
            error!("Replication of volume {} failed: {}", vol.name, e);
            let mut rollback = Rollback::new("create_volume_replica", &vol.name, &self.metrics);
            rollback
                .attempt(
                    "delete source session",
                    source.delete_by_name::<ReplicationSession>(&names.session),
                )
                .await;
            rollback
                .attempt(
                    "delete target session",
                    target.delete_by_name::<ReplicationSession>(&names.remote_session),
                )
                .await;
            rollback
                .attempt(
                    "delete target volume",
                    target.delete_by_name::<Volume>(&names.remote_vol),
                )
                .await;
            if scope == ReplicaScope::WithBaseVolume {
                rollback
                    .attempt("delete source volume", source.delete_by_name::<Volume>(&vol.name))
                    .await;
            }
            rollback
                .attempt(
                    "delete target volume group",
                    target.delete_by_name::<VolumeGroup>(&names.remote_vg),
                )
                .await;
            if scope == ReplicaScope::WithBaseVolume {
                rollback
                    .attempt(
                        "delete source volume group",
                        source.delete_by_name::<VolumeGroup>(&vg.name),
                    )
                    .await;
            }
            return Err(rollback.finish(e));
        }

        info!(
            "Volume {} replicated to {} as {}",
            vol.name,
            target.endpoint(),
            names.remote_vol
        );
        Ok(())
    }

    async fn establish_session(
        &self,
        names: &ReplicaNames,
        vg: &VolumeGroup,
        vol: &Volume,
    ) -> Result<()> {
        let replica = self.replica()?;
        let source = self.endpoints.source();

        let peer = source
            .find::<ReplicationPeer>(&Filter::new().eq("mgmt_host", &replica.backend_id))
            .await?
            .ok_or_else(|| Error::not_found(ReplicationPeer::KIND, &replica.backend_id))?;

        info!(
            "Creating replication session {} (target session {}, rpo {}s)",
            names.session, names.remote_session, replica.rpo
        );
        let session = source
            .create(&NewReplicationSession {
                name: names.session.clone(),
                replication_peer_k2array: peer.reference(),
                local_volume_group: vg.reference(),
                replication_peer_volume_group_name: names.remote_vg.clone(),
                remote_replication_session_name: names.remote_session.clone(),
                rpo: replica.rpo,
                auto_configure_peer_volumes: "False".to_string(),
            })
            .await?;

        debug!("Creating peer volume {} for {}", names.remote_vol, vol.name);
        source
            .create(&NewPeerVolume {
                name: names.remote_vol.clone(),
                local_volume: vol.reference(),
                replication_session: session.reference(),
            })
            .await?;

        source
            .update::<ReplicationSession>(session.id, json!({"state": SessionState::InSync}))
            .await?;
        Ok(())
    }

    /// Replicate a volume that already exists unreplicated
    pub async fn add_replication(&self, volume: &HostVolume) -> Result<()> {
        let client = self.endpoints.source();
        let vg = client
            .require::<VolumeGroup>(&naming::volume_group_name(&volume.id))
            .await?;
        let vol = client
            .require::<Volume>(&naming::volume_name(&volume.id))
            .await?;
        self.create_volume_replica(volume, &vg, &vol, ReplicaScope::SessionOnly)
            .await
    }

    /// Stop replicating a volume, keeping the base volume
    pub async fn remove_replication(&self, volume: &HostVolume) -> Result<()> {
        self.delete_volume_replica(volume).await
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Quiesce and delete both sessions, then the target-side objects.
    ///
    /// Missing objects are skipped, so a teardown that was interrupted can
    /// be run again.
    pub(crate) async fn delete_volume_replica(&self, volume: &HostVolume) -> Result<()> {
        let names = ReplicaNames::new(volume);
        self.teardown(&names)
            .await
            .map_err(|e| failed("delete_volume_replica", &names.vol, e))
    }

    async fn teardown(&self, names: &ReplicaNames) -> Result<()> {
        let source = self.endpoints.source();
        let target = self.endpoints.target()?;

        let src_session = source
            .find_by_name::<ReplicationSession>(&names.session)
            .await?;
        let tgt_session = target
            .find_by_name::<ReplicationSession>(&names.remote_session)
            .await?;

        if let Some(src) = &src_session {
            let steps: &[SessionState] = match src.state {
                SessionState::Idle => &[],
                SessionState::Suspended => &[SessionState::Idle],
                _ => &[SessionState::Suspended, SessionState::Idle],
            };
            for &state in steps {
                info!("Moving replication session {} to {}", src.name, state);
                source
                    .update::<ReplicationSession>(src.id, json!({ "state": state }))
                    .await?;
                match &tgt_session {
                    Some(tgt) => self.wait_for_session_state(target, tgt, state).await?,
                    None => warn!(
                        "Target session {} not found, not waiting for {}",
                        names.remote_session, state
                    ),
                }
            }
            if steps.is_empty() {
                if let Some(tgt) = &tgt_session {
                    self.wait_for_session_state(target, tgt, SessionState::Idle)
                        .await?;
                }
            }
        } else {
            warn!(
                "Replication session {} not found, skipping the suspend handshake",
                names.session
            );
        }

        if let Some(tgt) = &tgt_session {
            target.delete(tgt).await?;
        }
        if let Some(src) = &src_session {
            source.delete(src).await?;
        }

        if let Some(vg) = source.find_by_name::<VolumeGroup>(&names.vg).await? {
            source
                .delete_matching::<Snapshot>(&Filter::new().reference("volume_group", &vg.reference()))
                .await?;
        }
        if let Some(rvg) = target.find_by_name::<VolumeGroup>(&names.remote_vg).await? {
            target
                .delete_matching::<Snapshot>(&Filter::new().reference("volume_group", &rvg.reference()))
                .await?;
        }

        target.delete_by_name::<Volume>(&names.remote_vol).await?;
        target.delete_by_name::<VolumeGroup>(&names.remote_vg).await?;
        Ok(())
    }

    /// Poll `session` on `client` until it reports `state`, the teardown
    /// deadline passes or the orchestrator is cancelled
    pub(crate) async fn wait_for_session_state(
        &self,
        client: &ResilientClient,
        session: &ReplicationSession,
        state: SessionState,
    ) -> Result<()> {
        let timeout = self.config.teardown.timeout();
        let poll = self.config.teardown.poll_interval();
        let deadline = Instant::now() + timeout;

        loop {
            let current = client.get::<ReplicationSession>(session.id).await?;
            if current.state == state {
                debug!("Session {} reached {}", session.name, state);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    object: session.name.clone(),
                    state: state.to_string(),
                    waited: timeout,
                });
            }
            debug!(
                "Session {} is {}, waiting for {}",
                session.name, current.state, state
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        object: session.name.clone(),
                        state: state.to_string(),
                    });
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    // =========================================================================
    // Status / Failover
    // =========================================================================

    /// Whether the named volume group has a replication session
    pub async fn replica_status(&self, vg_name: &str) -> Result<bool> {
        let vg = self
            .endpoints
            .source()
            .require::<VolumeGroup>(vg_name)
            .await?;
        self.group_is_replicated(&vg).await
    }

    pub(crate) async fn group_is_replicated(&self, vg: &VolumeGroup) -> Result<bool> {
        let sessions = self
            .endpoints
            .source()
            .count::<ReplicationSession>(
                &Filter::new().reference("local_volume_group", &vg.reference()),
            )
            .await?;
        Ok(sessions != 0)
    }

    /// Promote the target array for the given volumes.
    ///
    /// Returns the backend now serving them and one status per volume; a
    /// volume that cannot be promoted is reported as an error without
    /// stopping the others.
    pub async fn failover_host(
        &self,
        volumes: &[HostVolume],
        secondary_id: Option<&str>,
    ) -> Result<(String, Vec<VolumeUpdate>)> {
        let replica = self.replica()?;
        if let Some(requested) = secondary_id {
            if requested != replica.backend_id {
                error!(
                    "Failover to {} requested, but the replica is {}",
                    requested, replica.backend_id
                );
                return Err(Error::InvalidFailoverTarget {
                    requested: requested.to_string(),
                    configured: replica.backend_id.clone(),
                });
            }
        }
        let target = self.endpoints.target()?;

        info!("Failing over {} volume(s) to {}", volumes.len(), replica.backend_id);
        let mut updates = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let status = match self.promote(target, volume).await {
                Ok(true) => VolumeUpdateStatus::FailedOver,
                Ok(false) => {
                    warn!("Volume {} has no replica on {}", volume.id, replica.backend_id);
                    VolumeUpdateStatus::Error
                }
                Err(e) => {
                    error!("Failover of volume {} failed: {}", volume.id, e);
                    VolumeUpdateStatus::Error
                }
            };
            updates.push(VolumeUpdate {
                volume_id: volume.id.clone(),
                status,
            });
        }
        Ok((replica.backend_id.clone(), updates))
    }

    /// Fail over one volume's target session; false when it has no replica
    async fn promote(&self, target: &ResilientClient, volume: &HostVolume) -> Result<bool> {
        let names = ReplicaNames::new(volume);
        if target
            .find_by_name::<Volume>(&names.remote_vol)
            .await?
            .is_none()
        {
            return Ok(false);
        }

        let session = target
            .require::<ReplicationSession>(&names.remote_session)
            .await?;
        if session.state == SessionState::InSync {
            info!("Failing over session {}", session.name);
            target
                .update::<ReplicationSession>(
                    session.id,
                    json!({"state": SessionState::FailedOver}),
                )
                .await?;
        }
        Ok(true)
    }
}
