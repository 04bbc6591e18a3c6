//! Test fixtures shared by the controller tests

use super::annotations::{set_annotation, ANN_CLASS, ANN_DYNAMICALLY_PROVISIONED};
use super::reconciler::{ControllerContext, ProvisionController};
use crate::cluster::memory::{MemoryBackend, MemoryClassCache, MemoryVolumeStore, RecordingEventSink};
use crate::config::ProvisionerConfig;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec,
    PersistentVolumeStatus,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const ME: &str = "example.com/iscsi";

pub fn claim(namespace: &str, name: &str, uid: &str, class: Option<&str>) -> PersistentVolumeClaim {
    let mut claim: PersistentVolumeClaim = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": uid,
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": "1Gi" } },
        },
    }))
    .expect("valid claim fixture");

    if let Some(class) = class {
        set_annotation(&mut claim.metadata, ANN_CLASS, class);
    }
    claim
}

pub fn class(name: &str, provisioner: &str) -> StorageClass {
    let mut parameters = BTreeMap::new();
    parameters.insert("pool".to_string(), "ssd".to_string());

    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: provisioner.to_string(),
        parameters: Some(parameters),
        ..Default::default()
    }
}

pub fn released_volume(name: &str, owner: Option<&str>) -> PersistentVolume {
    let mut volume = PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("{}-uid", name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                kind: Some("PersistentVolumeClaim".into()),
                namespace: Some("ns".into()),
                name: Some("pvc1".into()),
                ..Default::default()
            }),
            persistent_volume_reclaim_policy: Some("Delete".into()),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some("Released".into()),
            ..Default::default()
        }),
    };
    if let Some(owner) = owner {
        set_annotation(&mut volume.metadata, ANN_DYNAMICALLY_PROVISIONED, owner);
    }
    volume
}

pub struct Fixture {
    pub controller: Arc<ProvisionController>,
    pub volumes: Arc<MemoryVolumeStore>,
    pub classes: Arc<MemoryClassCache>,
    pub backend: Arc<MemoryBackend>,
    pub events: Arc<RecordingEventSink>,
}

/// Controller over in-memory collaborators, retrying without delay
pub fn fixture() -> Fixture {
    fixture_with(ProvisionerConfig {
        provisioner_name: ME.to_string(),
        retry_interval: Duration::ZERO,
        ..Default::default()
    })
}

pub fn fixture_with(config: ProvisionerConfig) -> Fixture {
    let volumes = Arc::new(MemoryVolumeStore::new());
    let classes = Arc::new(MemoryClassCache::new());
    let backend = Arc::new(MemoryBackend::new());
    let events = Arc::new(RecordingEventSink::new());

    let ctx = ControllerContext {
        volumes: volumes.clone(),
        classes: classes.clone(),
        backend: backend.clone(),
        events: events.clone(),
    };

    Fixture {
        controller: Arc::new(ProvisionController::new(&config, ctx)),
        volumes,
        classes,
        backend,
        events,
    }
}
