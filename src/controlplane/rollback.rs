//! Rollback Ledger
//!
//! Multi-step operations record compensating steps here when a forward step
//! fails. Every step is attempted even when an earlier one fails; failures
//! are logged and counted, and the error that started the rollback is the
//! one the caller sees.

use crate::error::{Error, Result};
use crate::metrics::DriverMetrics;
use std::future::Future;
use tracing::{debug, error, warn};

/// A compensating step that did not succeed
#[derive(Debug)]
pub struct CleanupFailure {
    pub step: String,
    pub error: Error,
}

/// Outcomes of the compensating steps of one failed operation
pub struct Rollback<'a> {
    operation: &'static str,
    object: String,
    metrics: &'a DriverMetrics,
    attempted: usize,
    failures: Vec<CleanupFailure>,
}

impl<'a> Rollback<'a> {
    pub fn new(operation: &'static str, object: impl Into<String>, metrics: &'a DriverMetrics) -> Self {
        Self {
            operation,
            object: object.into(),
            metrics,
            attempted: 0,
            failures: Vec::new(),
        }
    }

    /// Run one compensating step and record its outcome
    pub async fn attempt<T, F>(&mut self, step: &str, action: F)
    where
        F: Future<Output = Result<T>>,
    {
        self.attempted += 1;
        match action.await {
            Ok(_) => debug!("Rollback of {} {}: {} done", self.operation, self.object, step),
            Err(e) => {
                warn!(
                    "Rollback of {} {}: {} failed: {}",
                    self.operation, self.object, step, e
                );
                self.failures.push(CleanupFailure {
                    step: step.to_string(),
                    error: e,
                });
            }
        }
    }

    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }

    /// Close the ledger, wrapping the error that triggered it
    pub fn finish(self, original: Error) -> Error {
        self.metrics.record_rollback(self.operation);
        error!(
            "{} of {} failed: {} ({} of {} cleanup step(s) failed)",
            self.operation,
            self.object,
            original,
            self.failures.len(),
            self.attempted
        );
        Error::OperationFailed {
            operation: self.operation.to_string(),
            object: self.object,
            cleanup_failures: self.failures.len(),
            source: Box::new(original),
        }
    }
}

/// Add operation context to a failure that needed no cleanup
pub(crate) fn failed(operation: &str, object: &str, source: Error) -> Error {
    match source {
        // Already carries its context
        e @ (Error::OperationFailed { .. } | Error::Timeout { .. } | Error::Cancelled { .. }) => e,
        e if e.is_validation() => e,
        e => Error::OperationFailed {
            operation: operation.to_string(),
            object: object.to_string(),
            cleanup_failures: 0,
            source: Box::new(e),
        },
    }
}
