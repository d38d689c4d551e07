//! Error types for the K2 orchestrator
//!
//! Provides structured error types for the request layer, object lookups,
//! lifecycle validation, multi-step orchestration and driver setup.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("K2 transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("K2 request failed with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("K2 array busy, request may be retried: {reason}")]
    Retryable { reason: String },

    #[error("K2 request still failing after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Malformed K2 response for {path}: {reason}")]
    MalformedResponse { path: String, reason: String },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error(
        "Volume {volume} is attached and cannot be cloned; \
         create a snapshot of it and a volume from that snapshot instead"
    )]
    AttachedVolumeClone { volume: String },

    #[error("Cannot manage existing volume {name}: {reason}")]
    ManageExistingInvalid { name: String, reason: ManageRejection },

    #[error("Failover requested to {requested}, but the only replica is {configured}")]
    InvalidFailoverTarget { requested: String, configured: String },

    #[error("Replication is not configured for this backend")]
    ReplicationNotConfigured,

    #[error("Unsupported retype of volume {volume}: {reason}")]
    UnsupportedRetype { volume: String, reason: String },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error("{operation} of {object} failed ({cleanup_failures} cleanup step(s) also failed): {source}")]
    OperationFailed {
        operation: String,
        object: String,
        cleanup_failures: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Timed out after {waited:?} waiting for {object} to reach {state}")]
    Timeout {
        object: String,
        state: String,
        waited: Duration,
    },

    #[error("Cancelled while waiting for {object} to reach {state}")]
    Cancelled { object: String, state: String },

    #[error("Device connector error: {0}")]
    Device(String),

    // =========================================================================
    // Setup Errors
    // =========================================================================
    #[error("Driver setup failed: {0}")]
    Setup(String),

    #[error("K2 REST API version {found} is below the supported minimum {minimum}")]
    UnsupportedApiVersion { found: String, minimum: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is a transient array condition
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Retryable { .. } | Error::RetriesExhausted { .. } | Error::Transport(_)
        )
    }

    /// Check if this error rejects a request before any mutation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::AttachedVolumeClone { .. }
                | Error::ManageExistingInvalid { .. }
                | Error::InvalidFailoverTarget { .. }
                | Error::ReplicationNotConfigured
                | Error::UnsupportedRetype { .. }
        )
    }

    /// Check if this error reports a missing array object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Http { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// The error at the root of an orchestration failure
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::OperationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub(crate) fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Why an existing array volume cannot be brought under management
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManageRejection {
    NotFound,
    Replicated,
    Mapped,
    DedupMismatch { requested: bool, actual: bool },
}

impl std::fmt::Display for ManageRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManageRejection::NotFound => write!(f, "no such volume on the array"),
            ManageRejection::Replicated => write!(f, "its volume group is replicated"),
            ManageRejection::Mapped => write!(f, "it is mapped to a host"),
            ManageRejection::DedupMismatch { requested, actual } => write!(
                f,
                "volume type dedup={} does not match volume group dedup={}",
                requested, actual
            ),
        }
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
