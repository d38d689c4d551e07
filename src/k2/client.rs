//! Resilient K2 Client
//!
//! Wraps an [`ArrayTransport`] with the two guarantees the array's
//! management API needs from its callers:
//!
//! - **Serialization**: one lock per endpoint, held for exactly one remote
//!   call. Concurrent lifecycle operations against the same array queue on
//!   it; the source and target arrays have independent locks.
//! - **Busy retries**: an HTTP 400 carrying one of the array's transient
//!   busy markers is retried, with the lock released between attempts, up
//!   to [`MAX_K2_RETRY`] attempts in total. Everything else fails at once.

use crate::config::RetryConfig;
use crate::domain::ports::{ApiRequest, ArrayTransportRef};
use crate::error::{Error, Result};
use crate::k2::objects::{K2Resource, NewResource, ObjRef};
use crate::metrics::{DriverMetrics, RequestOutcome};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Maximum number of attempts for one request
pub const MAX_K2_RETRY: u32 = 5;

/// Error markers the array uses for transient busy conditions
pub const K2_RETRY_ERRORS: [&str; 4] = [
    "MC_ERR_BUSY",
    "MC_ERR_BUSY_SPECIFIC",
    "MC_ERR_INPROGRESS",
    "MC_ERR_START_TIMEOUT",
];

// =============================================================================
// Resilient Client
// =============================================================================

/// Serialized, retrying client for one array endpoint
pub struct ResilientClient {
    /// Role of the endpoint ("source" or "target"), used in logs and metrics
    label: String,
    transport: ArrayTransportRef,
    lock: Mutex<()>,
    retry: RetryConfig,
    metrics: Arc<DriverMetrics>,
}

impl ResilientClient {
    pub fn new(
        label: impl Into<String>,
        transport: ArrayTransportRef,
        retry: RetryConfig,
        metrics: Arc<DriverMetrics>,
    ) -> Self {
        Self {
            label: label.into(),
            transport,
            lock: Mutex::new(()),
            retry,
            metrics,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Management address behind this client
    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Execute one request with locking and busy retries
    pub async fn execute(&self, request: ApiRequest) -> Result<Value> {
        let mut pacing = self.pacing();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(&request).await {
                Ok(value) => {
                    let outcome = if attempt > 1 {
                        RequestOutcome::Retried
                    } else {
                        RequestOutcome::Success
                    };
                    self.metrics.record_request(&self.label, outcome);
                    return Ok(value);
                }
                Err(Error::Retryable { reason }) => {
                    if attempt >= MAX_K2_RETRY {
                        self.metrics
                            .record_request(&self.label, RequestOutcome::Failed);
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            reason,
                        });
                    }
                    self.metrics.record_retry(&self.label);
                    let pause = pacing
                        .next_backoff()
                        .unwrap_or_else(|| self.retry.initial_interval());
                    warn!(
                        "K2 {} busy on {} (attempt {}/{}), retrying in {:?}: {}",
                        self.label, request, attempt, MAX_K2_RETRY, pause, reason
                    );
                    tokio::time::sleep(pause).await;
                }
                Err(e) => {
                    self.metrics
                        .record_request(&self.label, RequestOutcome::Failed);
                    return Err(e);
                }
            }
        }
    }

    /// One locked call; the guard is dropped on every exit path
    async fn attempt(&self, request: &ApiRequest) -> Result<Value> {
        let _guard = self.lock.lock().await;
        debug!("K2 {} request: {}", self.label, request);
        self.transport.send(request).await.map_err(classify)
    }

    fn pacing(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_interval())
            .with_multiplier(self.retry.multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    // =========================================================================
    // Typed CRUD
    // =========================================================================

    /// Fetch the current state of an object by id
    pub async fn get<T: K2Resource>(&self, id: u64) -> Result<T> {
        let path = format!("/{}/{}", T::COLLECTION, id);
        let value = self.execute(ApiRequest::get(path.clone())).await?;
        decode(&path, value)
    }

    pub async fn create<N: NewResource>(&self, new: &N) -> Result<N::Created> {
        let path = format!("/{}", N::Created::COLLECTION);
        let body = serde_json::to_value(new)?;
        let value = self.execute(ApiRequest::post(path.clone(), body)).await?;
        decode(&path, value)
    }

    /// Patch fields of an object and return its new state
    pub async fn update<T: K2Resource>(&self, id: u64, patch: Value) -> Result<T> {
        let path = format!("/{}/{}", T::COLLECTION, id);
        let value = self.execute(ApiRequest::patch(path.clone(), patch)).await?;
        decode(&path, value)
    }

    pub async fn delete<T: K2Resource>(&self, object: &T) -> Result<()> {
        self.execute(ApiRequest::delete(object.path())).await?;
        Ok(())
    }

    pub async fn delete_ref(&self, reference: &ObjRef) -> Result<()> {
        self.execute(ApiRequest::delete(reference.path.clone()))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("label", &self.label)
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

/// Turn a busy HTTP 400 into a retryable error
fn classify(err: Error) -> Error {
    match err {
        Error::Http { status: 400, body } if is_busy(&body) => Error::Retryable { reason: body },
        other => other,
    }
}

fn is_busy(body: &str) -> bool {
    K2_RETRY_ERRORS.iter().any(|marker| body.contains(marker))
}

pub(crate) fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::MalformedResponse {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Endpoints
// =============================================================================

/// The source array and, when replication is configured, the target array
#[derive(Debug, Clone)]
pub struct Endpoints {
    source: Arc<ResilientClient>,
    target: Option<Arc<ResilientClient>>,
}

impl Endpoints {
    pub fn new(source: Arc<ResilientClient>, target: Option<Arc<ResilientClient>>) -> Self {
        Self { source, target }
    }

    pub fn source(&self) -> &ResilientClient {
        &self.source
    }

    pub fn target(&self) -> Result<&ResilientClient> {
        self.target
            .as_deref()
            .ok_or(Error::ReplicationNotConfigured)
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }
}
