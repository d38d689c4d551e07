//! Capacity Statistics
//!
//! Backend capacity as reported to the scheduler, derived from the array's
//! capacity counters (KiB) and its volume count. The last snapshot is
//! cached until the next refresh.

use crate::controlplane::Orchestrator;
use crate::error::{Error, Result};
use crate::k2::locator::Filter;
use crate::k2::objects::{K2Resource, SystemCapacity, Volume, KIB_PER_GIB};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const VENDOR_NAME: &str = "Kaminario";

/// Capacity snapshot of one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub volume_backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: String,
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
    pub provisioned_capacity_gb: f64,
    pub max_over_subscription_ratio: f64,
    pub total_volumes: u64,
    pub thin_provisioning_support: bool,
    pub thick_provisioning_support: bool,
    pub qos_support: bool,
    pub sparse_copy_volume: bool,
    pub multiattach: bool,
    /// Provisioning types the backend offers through `kaminario:thin_prov_type`
    pub thin_prov_types: String,
    pub replication_enabled: bool,
    pub replication_targets: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Provisioned over used capacity when auto calculation is on and the
/// array has used space; the configured ratio otherwise
pub fn oversubscription_ratio(capacity: &SystemCapacity, auto_calc: bool, configured: f64) -> f64 {
    let used = capacity.total.saturating_sub(capacity.free);
    if auto_calc && used != 0 {
        capacity.provisioned_volumes as f64 / used as f64
    } else {
        configured
    }
}

fn kib_to_gib(kib: u64) -> f64 {
    kib as f64 / KIB_PER_GIB as f64
}

impl Orchestrator {
    /// Query the array and replace the cached snapshot
    pub async fn update_volume_stats(&self) -> Result<VolumeStats> {
        let client = self.endpoints.source();
        let capacity = client
            .find::<SystemCapacity>(&Filter::new())
            .await?
            .ok_or_else(|| Error::not_found(SystemCapacity::KIND, client.endpoint()))?;
        // One volume on the array is internal
        let total_volumes = client
            .count::<Volume>(&Filter::new())
            .await?
            .saturating_sub(1);

        let replication_targets = self
            .config
            .replication_device
            .iter()
            .map(|r| r.backend_id.clone())
            .collect::<Vec<_>>();

        let stats = VolumeStats {
            volume_backend_name: self.config.backend_name().to_string(),
            vendor_name: VENDOR_NAME.to_string(),
            driver_version: crate::VERSION.to_string(),
            storage_protocol: self.config.protocol.to_string(),
            total_capacity_gb: kib_to_gib(capacity.total),
            free_capacity_gb: kib_to_gib(capacity.free),
            provisioned_capacity_gb: kib_to_gib(capacity.provisioned_volumes),
            max_over_subscription_ratio: oversubscription_ratio(
                &capacity,
                self.config.auto_calc_max_oversubscription_ratio,
                self.config.max_over_subscription_ratio,
            ),
            total_volumes,
            thin_provisioning_support: true,
            thick_provisioning_support: false,
            qos_support: false,
            sparse_copy_volume: true,
            multiattach: false,
            thin_prov_types: "dedup/nodedup".to_string(),
            replication_enabled: !replication_targets.is_empty(),
            replication_targets,
            updated_at: Utc::now(),
        };
        debug!(
            "K2 capacity: {:.2}/{:.2} GiB free, {} volume(s)",
            stats.free_capacity_gb, stats.total_capacity_gb, stats.total_volumes
        );

        *self.stats.write() = Some(stats.clone());
        Ok(stats)
    }

    /// Cached snapshot, refreshed when asked or when there is none yet
    pub async fn get_volume_stats(&self, refresh: bool) -> Result<VolumeStats> {
        if !refresh {
            let cached = self.stats.read().clone();
            if let Some(stats) = cached {
                return Ok(stats);
            }
        }
        self.update_volume_stats().await
    }
}
