//! Driver Metrics
//!
//! Prometheus counters for array requests, busy retries and compensating
//! rollbacks. Each orchestrator owns its registry so several drivers (and
//! tests) can live in one process.

use crate::error::Result;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Outcome label for a finished request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Retried,
    Failed,
}

impl RequestOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Retried => "retried",
            RequestOutcome::Failed => "failed",
        }
    }
}

/// Counters exported by one orchestrator
#[derive(Clone)]
pub struct DriverMetrics {
    registry: Registry,
    requests: IntCounterVec,
    retries: IntCounterVec,
    rollbacks: IntCounterVec,
}

impl DriverMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("k2_requests_total", "K2 management API requests by outcome"),
            &["endpoint", "outcome"],
        )?;
        let retries = IntCounterVec::new(
            Opts::new("k2_retries_total", "K2 requests retried on a busy array"),
            &["endpoint"],
        )?;
        let rollbacks = IntCounterVec::new(
            Opts::new("k2_rollbacks_total", "Compensating rollbacks by operation"),
            &["operation"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(rollbacks.clone()))?;

        Ok(Self {
            registry,
            requests,
            retries,
            rollbacks,
        })
    }

    pub fn record_request(&self, endpoint: &str, outcome: RequestOutcome) {
        self.requests
            .with_label_values(&[endpoint, outcome.as_label()])
            .inc();
    }

    pub fn record_retry(&self, endpoint: &str) {
        self.retries.with_label_values(&[endpoint]).inc();
    }

    pub fn record_rollback(&self, operation: &str) {
        self.rollbacks.with_label_values(&[operation]).inc();
    }

    pub fn retries(&self, endpoint: &str) -> u64 {
        self.retries.with_label_values(&[endpoint]).get()
    }

    pub fn rollbacks(&self, operation: &str) -> u64 {
        self.rollbacks.with_label_values(&[operation]).get()
    }

    /// Render all counters in the Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::Error::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for DriverMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverMetrics").finish_non_exhaustive()
    }
}
