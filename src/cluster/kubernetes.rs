//! Kubernetes adapters
//!
//! Implements the volume store, class cache and event sink ports on top of
//! the Kubernetes API via kube-rs.

use crate::domain::ports::{ClassCache, EventRecorder, EventSeverity, VolumeStore};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Client;
use std::sync::Arc;
use tracing::{debug, warn};

/// Controller name reported on events
pub const EVENT_COMPONENT: &str = "iscsi-provisioner";

// =============================================================================
// Volume Store
// =============================================================================

/// PersistentVolumes on the API server
#[derive(Clone)]
pub struct KubeVolumeStore {
    api: Api<PersistentVolume>,
}

impl KubeVolumeStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl VolumeStore for KubeVolumeStore {
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        Ok(self.api.create(&PostParams::default(), volume).await?)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

// =============================================================================
// Class Cache
// =============================================================================

impl ClassCache for Store<StorageClass> {
    fn get_class(&self, name: &str) -> Option<Arc<StorageClass>> {
        self.get(&ObjectRef::new(name))
    }
}

// =============================================================================
// Event Recorder
// =============================================================================

/// Publishes Kubernetes Events through the events.k8s.io API
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// Create a recorder. `instance` distinguishes replicas, usually the host
    /// name.
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: EVENT_COMPONENT.to_string(),
                instance,
            },
        }
    }
}

/// Short machine-readable action for an event reason
fn action_for(reason: &str) -> &'static str {
    if reason.starts_with("Provisioning") {
        "Provision"
    } else {
        "Delete"
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        subject: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), subject.clone());
        let event = Event {
            type_: match severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: action_for(reason).to_string(),
            secondary: None,
        };

        match recorder.publish(event).await {
            Ok(()) => debug!(
                subject = subject.name.as_deref().unwrap_or_default(),
                reason,
                "event recorded"
            ),
            Err(e) => warn!(
                subject = subject.name.as_deref().unwrap_or_default(),
                reason,
                "failed to record event: {}",
                e
            ),
        }
    }
}
