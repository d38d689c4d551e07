//! Driver Configuration
//!
//! Settings for one K2 backend: management credentials, the optional
//! replication target, request retry pacing and the replication teardown
//! handshake. Loaded from YAML by the CLI; every field except the
//! management credentials has a default.

use crate::domain::ports::Protocol;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Replication target description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Management address of the target array
    pub backend_id: String,
    pub login: String,
    pub password: String,
    /// Recovery point objective in seconds
    pub rpo: u64,
}

/// Pacing of retries on a busy array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }
}

/// Replication teardown handshake pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            timeout_secs: 300,
        }
    }
}

impl TeardownConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration for one K2 backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Management address of the source array
    pub san_ip: String,
    pub san_login: String,
    pub san_password: String,
    /// Validate the array's TLS certificate
    pub ssl_validate: bool,
    pub volume_backend_name: Option<String>,
    pub protocol: Protocol,
    pub replication_device: Option<ReplicaConfig>,
    /// Deprecated: volume types whose name contains this are nodedup
    pub nodedup_substring: String,
    pub auto_calc_max_oversubscription_ratio: bool,
    pub max_over_subscription_ratio: f64,
    /// Block size for volume copies, in bytes
    pub volume_dd_blocksize: u64,
    pub retry: RetryConfig,
    pub teardown: TeardownConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            san_ip: String::new(),
            san_login: String::new(),
            san_password: String::new(),
            ssl_validate: false,
            volume_backend_name: None,
            protocol: Protocol::Iscsi,
            replication_device: None,
            nodedup_substring: "K2-nodedup".to_string(),
            auto_calc_max_oversubscription_ratio: false,
            max_over_subscription_ratio: 20.0,
            volume_dd_blocksize: 1024 * 1024,
            retry: RetryConfig::default(),
            teardown: TeardownConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Load a configuration file in YAML
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DriverConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Ensure the options the driver cannot run without are set
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("san_ip", &self.san_ip),
            ("san_login", &self.san_login),
            ("san_password", &self.san_password),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!("{} is not set.", name)));
            }
        }

        if let Some(replica) = &self.replication_device {
            for (name, value) in [
                ("backend_id", &replica.backend_id),
                ("login", &replica.login),
                ("password", &replica.password),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::Configuration(format!(
                        "replication_device {} is not set.",
                        name
                    )));
                }
            }
            if replica.rpo == 0 {
                return Err(Error::Configuration(
                    "replication_device rpo is not set.".to_string(),
                ));
            }
        }

        if self.volume_dd_blocksize == 0 {
            return Err(Error::Configuration(
                "volume_dd_blocksize must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Backend name reported in stats
    pub fn backend_name(&self) -> &str {
        self.volume_backend_name
            .as_deref()
            .unwrap_or("KaminarioCinderDriver")
    }
}
