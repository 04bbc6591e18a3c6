//! Deletion state machine
//!
//! Reclaims the backend storage of a Released or Failed volume this
//! provisioner created, then removes the PersistentVolume.

use super::annotations::claim_ref_key;
use super::predicates::should_delete;
use super::reconciler::ProvisionController;
use crate::domain::ports::EventSeverity;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::Resource;
use tracing::{debug, info, warn};

/// Event reason when the backend fails to reclaim a volume
pub const REASON_VOLUME_FAILED_DELETE: &str = "VolumeFailedDelete";

/// Which exit the deletion state machine took
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Storage reclaimed and record removed
    Deleted,
    /// The volume could not be re-read
    FetchFailed,
    /// The volume no longer exists
    NotFound,
    /// The fresh volume no longer qualifies for deletion
    NotEligible,
    /// The backend failed to reclaim the storage
    BackendFailed,
    /// Storage reclaimed, but the record could not be removed
    RecordDeleteFailed,
}

impl DeleteOutcome {
    /// Label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteOutcome::Deleted => "deleted",
            DeleteOutcome::FetchFailed => "fetch_failed",
            DeleteOutcome::NotFound => "not_found",
            DeleteOutcome::NotEligible => "not_eligible",
            DeleteOutcome::BackendFailed => "backend_failed",
            DeleteOutcome::RecordDeleteFailed => "record_delete_failed",
        }
    }
}

impl ProvisionController {
    /// Reclaim one volume.
    ///
    /// Runs on its own task under the volume's operation key.
    pub async fn delete_volume_operation(&self, volume: &PersistentVolume) -> DeleteOutcome {
        let outcome = self.delete_volume(volume).await;
        if let Some(metrics) = &self.metrics {
            metrics.deletions.with_label_values(&[outcome.as_str()]).inc();
        }
        outcome
    }

    async fn delete_volume(&self, volume: &PersistentVolume) -> DeleteOutcome {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        debug!(volume = name, "deleteVolumeOperation started");

        // The triggering snapshot may be stale
        let fresh = match self.ctx.volumes.get_volume(name).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => {
                debug!(volume = name, "volume no longer exists, skipping");
                return DeleteOutcome::NotFound;
            }
            Err(e) => {
                info!(volume = name, "error reading persistent volume: {}", e);
                return DeleteOutcome::FetchFailed;
            }
        };
        if !should_delete(&fresh, &self.provisioner_name, self.ctx.backend.as_ref()).await {
            debug!(volume = name, "volume no longer needs deletion, skipping");
            return DeleteOutcome::NotEligible;
        }

        if let Err(e) = self.ctx.backend.deallocate(&fresh).await {
            info!(volume = name, "deletion of volume failed: {}", e);
            self.ctx
                .events
                .record(
                    &fresh.object_ref(&()),
                    EventSeverity::Warning,
                    REASON_VOLUME_FAILED_DELETE,
                    &e.to_string(),
                )
                .await;
            return DeleteOutcome::BackendFailed;
        }
        debug!(volume = name, "backend storage reclaimed");

        // On failure the record survives and the next resync retries
        match self.ctx.volumes.delete_volume(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(volume = name, "volume record already removed");
            }
            Err(e) => {
                warn!(volume = name, "failed to delete volume from the API server: {}", e);
                return DeleteOutcome::RecordDeleteFailed;
            }
        }

        let claim = fresh
            .spec
            .as_ref()
            .and_then(|spec| spec.claim_ref.as_ref())
            .map(claim_ref_key)
            .unwrap_or_default();
        info!(volume = name, claim = %claim, "volume deleted");
        DeleteOutcome::Deleted
    }
}
