//! Provisioning state machine
//!
//! Allocates backend storage for a claim, publishes the PersistentVolume
//! with bounded fixed-interval retries, and reclaims the storage again if
//! the volume can never be saved.

use super::annotations::{
    claim_class, claim_key, provisioned_volume_name, set_annotation, ANN_CLASS, ANN_CREATED_BY,
    ANN_DYNAMICALLY_PROVISIONED, CREATED_BY,
};
use super::reconciler::ProvisionController;
use crate::domain::ports::{AllocatedVolume, EventSeverity, VolumeOptions, RECLAIM_POLICY_DELETE};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    ISCSIPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Event reason when allocation or saving the volume fails
pub const REASON_PROVISIONING_FAILED: &str = "ProvisioningFailed";

/// Event reason when the storage of an unsaved volume cannot be reclaimed
pub const REASON_PROVISIONING_CLEANUP_FAILED: &str = "ProvisioningCleanupFailed";

/// Defaults for the iSCSI volume source, overridable per StorageClass
pub const PARAM_FS_TYPE: &str = "fsType";
pub const PARAM_LUN: &str = "lun";
pub const PARAM_READ_ONLY: &str = "readOnly";
const DEFAULT_FS_TYPE: &str = "ext3";
const DEFAULT_LUN: i32 = 0;

/// Which exit the provisioning state machine took
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// A volume with the deterministic name already exists
    AlreadyProvisioned,
    /// The existence check against the store failed
    StoreUnavailable,
    /// The claim is missing identity fields
    InvalidClaim,
    /// The claim's class is not in the cache
    ClassNotFound,
    /// The backend failed to allocate storage
    AllocationFailed,
    /// The volume was saved
    Provisioned { volume_name: String },
    /// Saving failed and the backend storage was reclaimed
    CleanedUp { volume_name: String },
    /// Saving and reclaiming both failed; storage is orphaned
    Orphaned { volume_name: String },
}

impl ProvisionOutcome {
    /// Label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionOutcome::AlreadyProvisioned => "already_provisioned",
            ProvisionOutcome::StoreUnavailable => "store_unavailable",
            ProvisionOutcome::InvalidClaim => "invalid_claim",
            ProvisionOutcome::ClassNotFound => "class_not_found",
            ProvisionOutcome::AllocationFailed => "allocation_failed",
            ProvisionOutcome::Provisioned { .. } => "provisioned",
            ProvisionOutcome::CleanedUp { .. } => "cleaned_up",
            ProvisionOutcome::Orphaned { .. } => "orphaned",
        }
    }
}

/// Reference to a claim, used as the volume's `claimRef` and event subject
pub fn claim_reference(claim: &PersistentVolumeClaim) -> Result<ObjectReference> {
    for (field, value) in [
        ("metadata.name", &claim.metadata.name),
        ("metadata.namespace", &claim.metadata.namespace),
        ("metadata.uid", &claim.metadata.uid),
    ] {
        if value.as_deref().map_or(true, str::is_empty) {
            return Err(Error::InvalidReference {
                kind: "PersistentVolumeClaim".into(),
                field: field.into(),
            });
        }
    }
    Ok(claim.object_ref(&()))
}

/// Build the PersistentVolume for storage the backend allocated
pub fn build_volume(options: &VolumeOptions, allocated: &AllocatedVolume) -> PersistentVolume {
    let fs_type = options
        .parameters
        .get(PARAM_FS_TYPE)
        .cloned()
        .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string());
    let lun = match options.parameters.get(PARAM_LUN) {
        Some(raw) => raw.parse::<i32>().unwrap_or_else(|_| {
            warn!(volume = %options.pv_name, "ignoring invalid lun parameter {:?}", raw);
            DEFAULT_LUN
        }),
        None => DEFAULT_LUN,
    };
    let read_only = options
        .parameters
        .get(PARAM_READ_ONLY)
        .map_or(false, |v| v.eq_ignore_ascii_case("true"));

    let mut annotations = BTreeMap::new();
    annotations.insert(ANN_CREATED_BY.to_string(), CREATED_BY.to_string());

    let capacity = options.capacity.clone().map(|quantity| {
        let mut capacity = BTreeMap::new();
        capacity.insert("storage".to_string(), quantity);
        capacity
    });

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(options.pv_name.clone()),
            labels: Some(BTreeMap::new()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some(options.reclaim_policy.clone()),
            access_modes: Some(options.access_modes.clone()),
            capacity,
            iscsi: Some(ISCSIPersistentVolumeSource {
                target_portal: allocated.location.clone(),
                iqn: allocated.identifier.clone(),
                lun,
                fs_type: Some(fs_type),
                read_only: Some(read_only),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

impl ProvisionController {
    /// Provision a volume for one claim.
    ///
    /// Runs on its own task under the claim's operation key.
    pub async fn provision_claim_operation(&self, claim: &PersistentVolumeClaim) -> ProvisionOutcome {
        let outcome = self.provision_claim(claim).await;
        if let Some(metrics) = &self.metrics {
            metrics.provisions.with_label_values(&[outcome.as_str()]).inc();
        }
        outcome
    }

    async fn provision_claim(&self, claim: &PersistentVolumeClaim) -> ProvisionOutcome {
        let key = claim_key(claim);
        let class_name = claim_class(claim);
        debug!(claim = %key, class = %class_name, "provisionClaimOperation started");

        // An earlier operation for this claim may have finished while this one
        // waited; the deterministic name makes that visible.
        let pv_name = provisioned_volume_name(claim);
        match self.ctx.volumes.get_volume(&pv_name).await {
            Ok(Some(_)) => {
                debug!(claim = %key, volume = %pv_name, "volume already exists, skipping");
                return ProvisionOutcome::AlreadyProvisioned;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(claim = %key, volume = %pv_name, "error checking for existing volume: {}", e);
                return ProvisionOutcome::StoreUnavailable;
            }
        }

        // Fail before any storage is allocated
        let claim_ref = match claim_reference(claim) {
            Ok(reference) => reference,
            Err(e) => {
                error!(claim = %key, "unexpected error getting claim reference: {}", e);
                return ProvisionOutcome::InvalidClaim;
            }
        };

        let Some(storage_class) = self.ctx.classes.get_class(&class_name) else {
            let e = Error::StorageClassNotFound { name: class_name };
            error!(claim = %key, "{}", e);
            return ProvisionOutcome::ClassNotFound;
        };

        let spec = claim.spec.clone().unwrap_or_default();
        let options = VolumeOptions {
            capacity: spec
                .resources
                .and_then(|resources| resources.requests)
                .and_then(|mut requests| requests.remove("storage")),
            access_modes: spec.access_modes.unwrap_or_default(),
            reclaim_policy: RECLAIM_POLICY_DELETE.to_string(),
            pv_name: pv_name.clone(),
            parameters: storage_class.parameters.clone().unwrap_or_default(),
        };

        let allocated = match self.ctx.backend.allocate(&options).await {
            Ok(allocated) => allocated,
            Err(e) => {
                let class_name = storage_class.metadata.name.as_deref().unwrap_or_default();
                error!(
                    claim = %key,
                    class = class_name,
                    "failed to provision volume: {}", e
                );
                let message = format!(
                    "Failed to provision volume with StorageClass {:?}: {}",
                    class_name, e
                );
                self.ctx
                    .events
                    .record(&claim_ref, EventSeverity::Warning, REASON_PROVISIONING_FAILED, &message)
                    .await;
                return ProvisionOutcome::AllocationFailed;
            }
        };
        info!(
            claim = %key,
            volume = %pv_name,
            target_portal = %allocated.location,
            iqn = %allocated.identifier,
            "volume created"
        );

        // The binder completes the binding from the claimRef
        let mut volume = build_volume(&options, &allocated);
        if let Some(spec) = volume.spec.as_mut() {
            spec.claim_ref = Some(claim_ref.clone());
        }
        set_annotation(&mut volume.metadata, ANN_DYNAMICALLY_PROVISIONED, &self.provisioner_name);
        set_annotation(&mut volume.metadata, ANN_CLASS, claim_class(claim));

        let save_error = match self.save_volume(&key, &volume).await {
            Ok(()) => {
                info!(claim = %key, volume = %pv_name, "volume provisioned");
                return ProvisionOutcome::Provisioned { volume_name: pv_name };
            }
            Err(e) => e,
        };

        // Storage exists without a PersistentVolume; reclaim it
        let message = format!(
            "Error creating provisioned PV object for claim {}: {}. Deleting the volume.",
            key, save_error
        );
        warn!(claim = %key, volume = %pv_name, "{}", message);
        self.ctx
            .events
            .record(&claim_ref, EventSeverity::Warning, REASON_PROVISIONING_FAILED, &message)
            .await;

        match self.cleanup_volume(&key, &volume).await {
            Ok(()) => ProvisionOutcome::CleanedUp { volume_name: pv_name },
            Err(e) => {
                let orphan = Error::OrphanedVolume {
                    volume_name: pv_name.clone(),
                };
                let message = format!(
                    "Error cleaning provisioned volume for claim {}: {}. Please delete manually.",
                    key, e
                );
                error!(claim = %key, "{}: {}", orphan, message);
                self.ctx
                    .events
                    .record(
                        &claim_ref,
                        EventSeverity::Warning,
                        REASON_PROVISIONING_CLEANUP_FAILED,
                        &message,
                    )
                    .await;
                ProvisionOutcome::Orphaned { volume_name: pv_name }
            }
        }
    }

    /// Create the volume record, retrying at a fixed interval
    async fn save_volume(&self, claim_key: &str, volume: &PersistentVolume) -> Result<()> {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        let mut attempt = 1;
        loop {
            debug!(claim = claim_key, volume = name, attempt, "trying to save volume");
            match self.ctx.volumes.create_volume(volume).await {
                Ok(_) => {
                    debug!(claim = claim_key, volume = name, "volume saved");
                    return Ok(());
                }
                // Same deterministic name, so it is this claim's volume
                Err(e) if e.is_already_exists() => {
                    debug!(claim = claim_key, volume = name, "volume saved concurrently");
                    return Ok(());
                }
                Err(e) if attempt >= self.retry_count => return Err(e),
                Err(e) => {
                    info!(claim = claim_key, volume = name, attempt, "failed to save volume: {}", e);
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Reclaim the storage of an unsaved volume, retrying at a fixed interval
    async fn cleanup_volume(&self, claim_key: &str, volume: &PersistentVolume) -> Result<()> {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        let mut attempt = 1;
        loop {
            match self.ctx.backend.deallocate(volume).await {
                Ok(()) => {
                    debug!(claim = claim_key, volume = name, "cleaning volume succeeded");
                    return Ok(());
                }
                Err(e) if attempt >= self.retry_count => return Err(e),
                Err(e) => {
                    info!(claim = claim_key, volume = name, attempt, "failed to delete volume: {}", e);
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}
