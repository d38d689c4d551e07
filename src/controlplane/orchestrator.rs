//! Main Orchestrator
//!
//! Owns the array endpoints and the driver configuration, and hosts the
//! lifecycle operations implemented in the sibling modules:
//! - Volume lifecycle (`volume`)
//! - Replication sessions and failover (`replication`)
//! - Host mappings (`connection`)
//! - Capacity reporting (`stats`)

use crate::config::{DriverConfig, ReplicaConfig};
use crate::controlplane::stats::VolumeStats;
use crate::domain::ports::{ArrayTransportRef, DeviceConnector, DeviceConnectorRef, VolumeType};
use crate::error::{Error, Result};
use crate::k2::locator::Filter;
use crate::k2::objects::SystemState;
use crate::k2::transport::{HttpTransport, HttpTransportConfig};
use crate::k2::{Endpoints, ResilientClient};
use crate::metrics::DriverMetrics;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Oldest management API the driver speaks
pub const K2_MIN_VERSION: &str = "2.2.0";

/// Orchestrator for one K2 backend and its optional replication target
pub struct Orchestrator {
    pub(crate) config: DriverConfig,
    pub(crate) endpoints: Endpoints,
    /// Copies data between attached devices for clones
    pub(crate) device: Option<DeviceConnectorRef>,
    /// Last capacity snapshot
    pub(crate) stats: RwLock<Option<VolumeStats>>,
    pub(crate) metrics: Arc<DriverMetrics>,
    /// Aborts replication teardown waits
    pub(crate) cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator over already built transports.
    ///
    /// A target transport is required exactly when the configuration names
    /// a replication device.
    pub fn new(
        config: DriverConfig,
        source: ArrayTransportRef,
        target: Option<ArrayTransportRef>,
    ) -> Result<Self> {
        let metrics = Arc::new(DriverMetrics::new()?);

        let target = match (&config.replication_device, target) {
            (Some(_), Some(transport)) => Some(Arc::new(ResilientClient::new(
                "target",
                transport,
                config.retry.clone(),
                metrics.clone(),
            ))),
            (None, None) => None,
            (Some(replica), None) => {
                return Err(Error::Configuration(format!(
                    "replication device {} has no transport",
                    replica.backend_id
                )))
            }
            (None, Some(_)) => {
                return Err(Error::Configuration(
                    "target transport given without replication_device".to_string(),
                ))
            }
        };
        let source = Arc::new(ResilientClient::new(
            "source",
            source,
            config.retry.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            config,
            endpoints: Endpoints::new(source, target),
            device: None,
            stats: RwLock::new(None),
            metrics,
            cancel: CancellationToken::new(),
        })
    }

    /// Create an orchestrator talking HTTPS to the configured arrays
    pub fn connect(config: DriverConfig) -> Result<Self> {
        let mut source = HttpTransportConfig::new(
            config.san_ip.clone(),
            config.san_login.clone(),
            config.san_password.clone(),
        );
        source.ssl_validate = config.ssl_validate;
        let source: ArrayTransportRef = Arc::new(HttpTransport::new(source)?);

        let target = match &config.replication_device {
            Some(replica) => {
                let mut target = HttpTransportConfig::new(
                    replica.backend_id.clone(),
                    replica.login.clone(),
                    replica.password.clone(),
                );
                target.ssl_validate = config.ssl_validate;
                Some(Arc::new(HttpTransport::new(target)?) as ArrayTransportRef)
            }
            None => None,
        };

        Self::new(config, source, target)
    }

    pub fn with_device_connector(mut self, device: DeviceConnectorRef) -> Self {
        self.device = Some(device);
        self
    }

    /// Use a caller-owned token to abort teardown waits
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn metrics(&self) -> &DriverMetrics {
        &self.metrics
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Validate the configuration before any array is contacted
    pub fn do_setup(&self) -> Result<()> {
        self.config.validate()?;
        info!(
            "K2 backend {} configured for {} on {}{}",
            self.config.backend_name(),
            self.config.protocol,
            self.config.san_ip,
            self.config
                .replication_device
                .as_ref()
                .map(|r| format!(", replicating to {}", r.backend_id))
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Verify every configured array speaks a supported API version
    pub async fn check_for_setup_error(&self) -> Result<()> {
        check_api_version(self.endpoints.source()).await?;
        if self.endpoints.has_target() {
            check_api_version(self.endpoints.target()?).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Volume Type Policy
    // =========================================================================

    /// Whether volumes of this type live in a deduplicated group
    pub fn is_dedup(&self, volume_type: Option<&VolumeType>) -> bool {
        let Some(volume_type) = volume_type else {
            return true;
        };
        if volume_type.thin_prov_type() == Some("nodedup") {
            return false;
        }
        if !self.config.nodedup_substring.is_empty()
            && volume_type.name.contains(&self.config.nodedup_substring)
        {
            warn!(
                "Selecting nodedup by the substring {} in volume type {} is deprecated",
                self.config.nodedup_substring, volume_type.name
            );
            return false;
        }
        true
    }

    /// Whether volumes of this type get a replica. Without a configured
    /// replication device the type's request is ignored.
    pub fn is_replicated(&self, volume_type: Option<&VolumeType>) -> bool {
        volume_type.is_some_and(VolumeType::replication_requested)
            && self.config.replication_device.is_some()
    }

    pub(crate) fn replica(&self) -> Result<&ReplicaConfig> {
        self.config
            .replication_device
            .as_ref()
            .ok_or(Error::ReplicationNotConfigured)
    }

    pub(crate) fn device(&self) -> Result<&dyn DeviceConnector> {
        self.device
            .as_deref()
            .ok_or_else(|| Error::Configuration("no device connector configured".to_string()))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.config.backend_name())
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

async fn check_api_version(client: &ResilientClient) -> Result<()> {
    let state = client
        .find::<SystemState>(&Filter::new())
        .await?
        .ok_or_else(|| {
            Error::Setup(format!(
                "K2 {} ({}) reports no system state",
                client.label(),
                client.endpoint()
            ))
        })?;

    let found = parse_version(&state.rest_api_version).ok_or_else(|| {
        Error::Setup(format!(
            "K2 {} reports an unreadable API version {}",
            client.label(),
            state.rest_api_version
        ))
    })?;
    let minimum = parse_version(K2_MIN_VERSION)
        .ok_or_else(|| Error::Internal(format!("bad minimum version {}", K2_MIN_VERSION)))?;

    if found < minimum {
        return Err(Error::UnsupportedApiVersion {
            found: state.rest_api_version,
            minimum: K2_MIN_VERSION.to_string(),
        });
    }

    info!(
        "K2 {} ({}) REST API version {}",
        client.label(),
        client.endpoint(),
        state.rest_api_version
    );
    Ok(())
}

/// Numeric `major.minor.patch`; missing parts count as zero
fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.trim().split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;
    Some((major, minor, patch))
}
