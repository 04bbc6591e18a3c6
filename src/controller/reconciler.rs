//! Provision controller and its event handlers
//!
//! Handlers are pure dispatch: evaluate a predicate, then hand the work to
//! the operation scheduler. They never run a state machine inline.

use super::annotations::claim_key;
use super::predicates::{may_delete, should_provision};
use super::scheduler::{delete_key, provision_key, OperationScheduler};
use crate::config::ProvisionerConfig;
use crate::domain::ports::{ClassCacheRef, EventRecorderRef, VolumeBackendRef, VolumeStoreRef};
use crate::metrics::Metrics;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// External collaborators of the controller
#[derive(Clone)]
pub struct ControllerContext {
    /// PersistentVolume records
    pub volumes: VolumeStoreRef,
    /// StorageClass cache
    pub classes: ClassCacheRef,
    /// Storage backend
    pub backend: VolumeBackendRef,
    /// Event sink
    pub events: EventRecorderRef,
}

/// Dynamic provisioning controller
pub struct ProvisionController {
    /// Identity matched against `StorageClass.provisioner`
    pub(crate) provisioner_name: String,
    /// Attempts for saving and cleaning up a provisioned volume
    pub(crate) retry_count: u32,
    /// Fixed interval between attempts
    pub(crate) retry_interval: Duration,
    pub(crate) ctx: ControllerContext,
    scheduler: OperationScheduler,
    pub(crate) metrics: Option<Metrics>,
}

impl ProvisionController {
    /// Create a new controller
    pub fn new(config: &ProvisionerConfig, ctx: ControllerContext) -> Self {
        Self {
            provisioner_name: config.provisioner_name.clone(),
            retry_count: config.retry_count.max(1),
            retry_interval: config.retry_interval,
            ctx,
            scheduler: OperationScheduler::new(),
            metrics: None,
        }
    }

    /// Report operation outcomes and scheduler state to `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.scheduler = OperationScheduler::with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn provisioner_name(&self) -> &str {
        &self.provisioner_name
    }

    pub fn scheduler(&self) -> &OperationScheduler {
        &self.scheduler
    }

    /// Claim added or updated (resyncs arrive as updates).
    ///
    /// Returns the handle of the provisioning operation if one was started.
    pub fn on_claim(self: &Arc<Self>, claim: Arc<PersistentVolumeClaim>) -> Option<JoinHandle<()>> {
        if !should_provision(&claim, self.ctx.classes.as_ref(), &self.provisioner_name) {
            return None;
        }

        let uid = claim.metadata.uid.clone().unwrap_or_default();
        let key = provision_key(&claim_key(&claim), &uid);
        info!(claim = %claim_key(&claim), "claim needs a volume");

        let controller = self.clone();
        self.scheduler.schedule(key, async move {
            controller.provision_claim_operation(&claim).await;
        })
    }

    /// Volume updated (resyncs arrive as updates).
    ///
    /// Only phase and ownership are checked here. The backend lookup runs in
    /// the deletion operation, off the dispatch loop.
    ///
    /// Returns the handle of the deletion operation if one was started.
    pub fn on_volume(self: &Arc<Self>, volume: Arc<PersistentVolume>) -> Option<JoinHandle<()>> {
        if !may_delete(&volume, &self.provisioner_name) {
            return None;
        }

        let name = volume.metadata.name.clone().unwrap_or_default();
        let uid = volume.metadata.uid.clone().unwrap_or_default();
        info!(volume = %name, "volume needs reclaiming");

        let controller = self.clone();
        self.scheduler.schedule(delete_key(&name, &uid), async move {
            controller.delete_volume_operation(&volume).await;
        })
    }

    /// Claims and volumes leaving the cluster need no action
    pub fn on_deleted(&self, kind: &str, name: &str) {
        debug!(kind, name, "object deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{claim, class, fixture, released_volume, ME};

    #[tokio::test]
    async fn test_claim_handler_dispatches_provisioning() {
        let f = fixture();
        f.classes.insert(class("fast", ME));

        let handle = f
            .controller
            .on_claim(Arc::new(claim("ns", "pvc1", "u1", Some("fast"))))
            .expect("provisioning scheduled");
        handle.await.unwrap();

        assert!(f.volumes.get("pvc-u1").is_some());
    }

    #[tokio::test]
    async fn test_claim_handler_ignores_foreign_claims() {
        let f = fixture();
        f.classes.insert(class("fast", "kubernetes.io/aws-ebs"));

        let handle = f
            .controller
            .on_claim(Arc::new(claim("ns", "pvc1", "u1", Some("fast"))));
        assert!(handle.is_none());
        assert_eq!(f.backend.allocate_calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_claim_events_collapse() {
        let f = fixture();
        f.classes.insert(class("fast", ME));
        let gate = f.backend.block_allocations();

        let c = Arc::new(claim("ns", "pvc1", "u1", Some("fast")));
        let first = f.controller.on_claim(c.clone()).expect("first event schedules");
        assert!(f.controller.on_claim(c.clone()).is_none());
        assert!(f.controller.on_claim(c).is_none());

        gate.open();
        first.await.unwrap();
        assert_eq!(f.backend.allocate_calls(), 1);
        assert_eq!(f.volumes.len(), 1);
    }

    #[tokio::test]
    async fn test_volume_handler_dispatches_deletion() {
        let f = fixture();
        let volume = released_volume("pvc-u1", Some(ME));
        f.volumes.insert(volume.clone());
        f.backend.seed("pvc-u1");

        let handle = f
            .controller
            .on_volume(Arc::new(volume))
            .expect("deletion scheduled");
        handle.await.unwrap();

        assert!(f.volumes.get("pvc-u1").is_none());
        assert_eq!(f.backend.deallocate_calls(), 1);
    }

    #[tokio::test]
    async fn test_volume_handler_ignores_foreign_volumes() {
        let f = fixture();
        let volume = released_volume("pvc-u1", Some("someone-else"));
        f.volumes.insert(volume.clone());
        f.backend.seed("pvc-u1");

        assert!(f.controller.on_volume(Arc::new(volume)).is_none());
        assert_eq!(f.backend.deallocate_calls(), 0);
    }

    #[tokio::test]
    async fn test_absent_storage_is_checked_in_the_operation() {
        let f = fixture();
        let volume = released_volume("pvc-u1", Some(ME));
        f.volumes.insert(volume.clone());

        // Dispatch does not consult the backend; the operation finds nothing to reclaim
        let handle = f
            .controller
            .on_volume(Arc::new(volume))
            .expect("deletion scheduled");
        handle.await.unwrap();

        assert_eq!(f.backend.deallocate_calls(), 0);
        assert!(f.volumes.get("pvc-u1").is_some());
        assert!(f.controller.scheduler().is_empty());
    }
}
