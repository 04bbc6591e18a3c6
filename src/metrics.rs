//! Provisioner metrics
//!
//! Prometheus metrics for provisioning and deletion outcomes and for the
//! operation scheduler, exposed on `/metrics`.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics handle, cheap to clone
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Finished provisioning operations by outcome
    pub provisions: IntCounterVec,
    /// Finished deletion operations by outcome
    pub deletions: IntCounterVec,
    /// Requests dropped because the same operation was running
    pub operations_deduplicated: IntCounter,
    /// Currently running operations
    pub operations_running: IntGauge,
}

impl Metrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let provisions = IntCounterVec::new(
            Opts::new(
                "provisioner_provisions_total",
                "Provisioning operations by outcome",
            ),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let deletions = IntCounterVec::new(
            Opts::new("provisioner_deletions_total", "Deletion operations by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let operations_deduplicated = IntCounter::new(
            "provisioner_operations_deduplicated_total",
            "Operation requests dropped because the operation was already running",
        )
        .map_err(metrics_error)?;
        let operations_running = IntGauge::new(
            "provisioner_operations_running",
            "Operations currently running",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(provisions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(deletions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(operations_deduplicated.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(operations_running.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            provisions,
            deletions,
            operations_deduplicated,
            operations_running,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> Result<(String, String)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        let body = String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics are not UTF-8: {}", e)))?;
        Ok((encoder.format_type().to_string(), body))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics error: {}", e))
}
