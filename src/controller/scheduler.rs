//! Operation deduplication scheduler
//!
//! Runs at most one asynchronous operation per operation key. Keys are built
//! per resource instance (`provision-<ns>/<name>[<uid>]`,
//! `delete-<name>[<uid>]`), so repeated watch events for one resource collapse
//! into a single running operation while different resources never collide.
//!
//! A request whose key is already running is dropped, not queued: the running
//! operation converges on the same end state, and the next resync re-triggers
//! evaluation if it does not.

use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

/// Key for a provisioning operation
pub fn provision_key(claim_key: &str, uid: &str) -> String {
    format!("provision-{}[{}]", claim_key, uid)
}

/// Key for a deletion operation
pub fn delete_key(volume_name: &str, uid: &str) -> String {
    format!("delete-{}[{}]", volume_name, uid)
}

/// A running operation as reported on `/operations`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningOperation {
    pub key: String,
    pub started_at: DateTime<Utc>,
}

/// Registry of running operations
#[derive(Clone, Default)]
pub struct OperationScheduler {
    /// Running operation keys and their start time
    running: Arc<DashMap<String, DateTime<Utc>>>,
    metrics: Option<Metrics>,
}

impl OperationScheduler {
    /// Create a new scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scheduler that reports to the given metrics
    pub fn with_metrics(metrics: Metrics) -> Self {
        Self {
            running: Arc::new(DashMap::new()),
            metrics: Some(metrics),
        }
    }

    /// Start `operation` on the runtime unless an operation with `key` is
    /// already running.
    ///
    /// Returns the handle of the started task, or `None` if the request was
    /// dropped. Never waits for the operation.
    pub fn schedule<F>(&self, key: impl Into<String>, operation: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        debug!(operation = %key, "scheduleOperation");

        match self.running.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(operation = %key, "operation is already running, skipping");
                if let Some(metrics) = &self.metrics {
                    metrics.operations_deduplicated.inc();
                }
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.operations_running.inc();
        }

        let guard = RunningGuard {
            key: key.clone(),
            running: self.running.clone(),
            metrics: self.metrics.clone(),
        };
        let span = tracing::debug_span!("operation", key = %key);

        Some(tokio::spawn(
            async move {
                let _guard = guard;
                operation.await;
            }
            .instrument(span),
        ))
    }

    /// Is an operation with this key running?
    pub fn is_running(&self, key: &str) -> bool {
        self.running.contains_key(key)
    }

    /// Keys of all running operations, sorted
    pub fn running(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Running operations with their start time, sorted by key
    pub fn snapshot(&self) -> Vec<RunningOperation> {
        let mut operations: Vec<RunningOperation> = self
            .running
            .iter()
            .map(|e| RunningOperation {
                key: e.key().clone(),
                started_at: *e.value(),
            })
            .collect();
        operations.sort_by(|a, b| a.key.cmp(&b.key));
        operations
    }

    /// Number of running operations
    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

/// Releases the operation key when the task finishes or unwinds
struct RunningGuard {
    key: String,
    running: Arc<DashMap<String, DateTime<Utc>>>,
    metrics: Option<Metrics>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Some((_, started)) = self.running.remove(&self.key) {
            debug!(
                operation = %self.key,
                elapsed_ms = (Utc::now() - started).num_milliseconds(),
                "operation finished"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.operations_running.dec();
        }
    }
}
