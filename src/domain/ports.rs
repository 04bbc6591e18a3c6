//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the provisioning engine and
//! external systems: the cluster-state store, the local StorageClass cache,
//! the event sink and the storage backend. Adapters implement these traits
//! to provide concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Volume Options
// =============================================================================

/// Reclaim policy stamped on every provisioned volume
pub const RECLAIM_POLICY_DELETE: &str = "Delete";

/// Everything the backend needs to allocate storage for one claim
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeOptions {
    /// Requested capacity (e.g., "1Gi")
    pub capacity: Option<Quantity>,
    /// Requested access modes
    pub access_modes: Vec<String>,
    /// Reclaim policy for the PersistentVolume
    pub reclaim_policy: String,
    /// Deterministic PersistentVolume name, also used as the backend name
    pub pv_name: String,
    /// Parameters from the StorageClass
    pub parameters: BTreeMap<String, String>,
}

/// Result of a successful backend allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedVolume {
    /// Where the storage is reachable (iSCSI target portal)
    #[serde(rename = "targetPortal")]
    pub location: String,
    /// Backend identifier of the storage (iSCSI qualified name)
    #[serde(rename = "iqn")]
    pub identifier: String,
}

// =============================================================================
// Event Severity
// =============================================================================

/// Severity of an event recorded against a claim or volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Normal => write!(f, "Normal"),
            EventSeverity::Warning => write!(f, "Warning"),
        }
    }
}

// =============================================================================
// Volume Store Port
// =============================================================================

/// Port for reading and writing PersistentVolume records
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Get a volume by name, `None` if it does not exist
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Create a volume record
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume>;

    /// Delete a volume record
    async fn delete_volume(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Class Cache Port
// =============================================================================

/// Read-through cache of StorageClasses, keyed by class name
pub trait ClassCache: Send + Sync {
    fn get_class(&self, name: &str) -> Option<Arc<StorageClass>>;
}

// =============================================================================
// Event Recorder Port
// =============================================================================

/// Sink for human-readable events attached to cluster objects
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record an event. Failures to record are logged by the implementation,
    /// never surfaced to the caller.
    async fn record(
        &self,
        subject: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    );
}

// =============================================================================
// Volume Backend Port
// =============================================================================

/// Port for the storage backend that owns the bytes
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Allocate storage for a volume
    async fn allocate(&self, options: &VolumeOptions) -> Result<AllocatedVolume>;

    /// Release the storage behind a volume
    async fn deallocate(&self, volume: &PersistentVolume) -> Result<()>;

    /// Cheap check: does the backend artifact for this volume still exist
    async fn exists(&self, volume_name: &str) -> Result<bool>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeStoreRef = Arc<dyn VolumeStore>;
pub type ClassCacheRef = Arc<dyn ClassCache>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
pub type VolumeBackendRef = Arc<dyn VolumeBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_severity_display() {
        assert_eq!(format!("{}", EventSeverity::Normal), "Normal");
        assert_eq!(format!("{}", EventSeverity::Warning), "Warning");
    }

    #[test]
    fn test_allocated_volume_wire_names() {
        let vol: AllocatedVolume = serde_json::from_str(
            r#"{"targetPortal": "10.0.0.1:3260", "iqn": "iqn.2016-10.io.example:vol1"}"#,
        )
        .unwrap();
        assert_eq!(vol.location, "10.0.0.1:3260");
        assert_eq!(vol.identifier, "iqn.2016-10.io.example:vol1");
    }
}
