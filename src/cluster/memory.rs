//! In-memory adapters
//!
//! Volume store, class cache, event sink and backend kept entirely in
//! process memory. Used to drive the controller without a cluster, with
//! hooks for injecting failures.

use crate::domain::ports::{
    AllocatedVolume, ClassCache, EventRecorder, EventSeverity, VolumeBackend, VolumeOptions,
    VolumeStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use k8s_openapi::api::storage::v1::StorageClass;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Take one injected failure, `usize::MAX` meaning "always fail"
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
            0 => None,
            usize::MAX => Some(usize::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

// =============================================================================
// Volume Store
// =============================================================================

/// PersistentVolume records in memory
#[derive(Default)]
pub struct MemoryVolumeStore {
    volumes: RwLock<BTreeMap<String, PersistentVolume>>,
    create_calls: AtomicUsize,
    create_failures: AtomicUsize,
    fail_get: AtomicBool,
    fail_delete: AtomicBool,
    lose_on_delete: AtomicBool,
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a volume without going through `create_volume`
    pub fn insert(&self, volume: PersistentVolume) {
        let name = volume.metadata.name.clone().unwrap_or_default();
        self.volumes.write().insert(name, volume);
    }

    pub fn get(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.volumes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.read().is_empty()
    }

    /// Reject the next `count` creates
    pub fn fail_creates(&self, count: usize) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Drop the record right before a delete, as if someone else removed it
    pub fn set_lose_on_delete(&self, lose: bool) {
        self.lose_on_delete.store(lose, Ordering::SeqCst);
    }
}

#[async_trait]
impl VolumeStore for MemoryVolumeStore {
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("get of volume {} rejected", name)));
        }
        Ok(self.get(name))
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let name = volume.metadata.name.clone().unwrap_or_default();
        if take_failure(&self.create_failures) {
            return Err(Error::Internal(format!("create of volume {} rejected", name)));
        }

        let mut volumes = self.volumes.write();
        if volumes.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "PersistentVolume".into(),
                name,
            });
        }
        volumes.insert(name, volume.clone());
        Ok(volume.clone())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("delete of volume {} rejected", name)));
        }
        let mut volumes = self.volumes.write();
        if self.lose_on_delete.load(Ordering::SeqCst) {
            volumes.remove(name);
        }
        match volumes.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: name.into(),
            }),
        }
    }
}

// =============================================================================
// Class Cache
// =============================================================================

/// StorageClasses in memory, keyed by name
#[derive(Default)]
pub struct MemoryClassCache {
    classes: RwLock<BTreeMap<String, Arc<StorageClass>>>,
}

impl MemoryClassCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, class: StorageClass) {
        let name = class.metadata.name.clone().unwrap_or_default();
        self.classes.write().insert(name, Arc::new(class));
    }
}

impl ClassCache for MemoryClassCache {
    fn get_class(&self, name: &str) -> Option<Arc<StorageClass>> {
        self.classes.read().get(name).cloned()
    }
}

// =============================================================================
// Event Sink
// =============================================================================

/// An event captured by [`RecordingEventSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub subject: ObjectReference,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

/// Keeps every recorded event
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons in recording order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEventSink {
    async fn record(
        &self,
        subject: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) {
        self.events.lock().push(RecordedEvent {
            subject: subject.clone(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Holds allocations back until opened
pub struct AllocationGate {
    tx: watch::Sender<bool>,
}

impl AllocationGate {
    pub fn open(&self) {
        let _ = self.tx.send(true);
    }
}

/// Backend that tracks allocated volume names in memory
pub struct MemoryBackend {
    portal: String,
    artifacts: Mutex<BTreeSet<String>>,
    last_options: Mutex<Option<VolumeOptions>>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    allocate_calls: AtomicUsize,
    deallocate_calls: AtomicUsize,
    fail_allocate: AtomicBool,
    deallocate_failures: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            portal: "10.0.0.1:3260".to_string(),
            artifacts: Mutex::new(BTreeSet::new()),
            last_options: Mutex::new(None),
            gate: Mutex::new(None),
            allocate_calls: AtomicUsize::new(0),
            deallocate_calls: AtomicUsize::new(0),
            fail_allocate: AtomicBool::new(false),
            deallocate_failures: AtomicUsize::new(0),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend storage for `name` was allocated earlier
    pub fn seed(&self, name: &str) {
        self.artifacts.lock().insert(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.lock().contains(name)
    }

    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::SeqCst)
    }

    pub fn deallocate_calls(&self) -> usize {
        self.deallocate_calls.load(Ordering::SeqCst)
    }

    /// Options of the most recent allocation
    pub fn last_options(&self) -> Option<VolumeOptions> {
        self.last_options.lock().clone()
    }

    pub fn set_fail_allocate(&self, fail: bool) {
        self.fail_allocate.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` deallocations
    pub fn fail_deallocations(&self, count: usize) {
        self.deallocate_failures.store(count, Ordering::SeqCst);
    }

    /// Make allocations wait until the returned gate is opened
    pub fn block_allocations(&self) -> AllocationGate {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock() = Some(rx);
        AllocationGate { tx }
    }
}

#[async_trait]
impl VolumeBackend for MemoryBackend {
    async fn allocate(&self, options: &VolumeOptions) -> Result<AllocatedVolume> {
        self.allocate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options.clone());

        let gate = self.gate.lock().clone();
        if let Some(mut rx) = gate {
            rx.wait_for(|open| *open)
                .await
                .map_err(|_| Error::BackendUnavailable {
                    backend: "memory".into(),
                })?;
        }

        if self.fail_allocate.load(Ordering::SeqCst) {
            return Err(Error::BackendOperationFailed {
                backend: "memory".into(),
                operation: "allocate".into(),
                reason: "allocation rejected".into(),
            });
        }

        self.artifacts.lock().insert(options.pv_name.clone());
        Ok(AllocatedVolume {
            location: self.portal.clone(),
            identifier: format!("iqn.2016-10.io.example:{}", options.pv_name),
        })
    }

    async fn deallocate(&self, volume: &PersistentVolume) -> Result<()> {
        self.deallocate_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.deallocate_failures) {
            return Err(Error::BackendOperationFailed {
                backend: "memory".into(),
                operation: "deallocate".into(),
                reason: "deallocation rejected".into(),
            });
        }
        if let Some(name) = volume.metadata.name.as_deref() {
            self.artifacts.lock().remove(name);
        }
        Ok(())
    }

    async fn exists(&self, volume_name: &str) -> Result<bool> {
        Ok(self.contains(volume_name))
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn volume(name: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_store_rejects_duplicates() {
        let store = MemoryVolumeStore::new();
        store.create_volume(&volume("pvc-u1")).await.unwrap();

        let err = store.create_volume(&volume("pvc-u1")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_injected_failures_run_out() {
        let store = MemoryVolumeStore::new();
        store.fail_creates(2);

        assert!(store.create_volume(&volume("a")).await.is_err());
        assert!(store.create_volume(&volume("a")).await.is_err());
        assert!(store.create_volume(&volume("a")).await.is_ok());
        assert_eq!(store.create_calls(), 3);
    }

    #[tokio::test]
    async fn test_store_delete_missing() {
        let store = MemoryVolumeStore::new();
        let err = store.delete_volume("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
