//! Decision predicates
//!
//! Re-evaluated on every watch event, including resync replays, so they only
//! read their inputs and gate the expensive asynchronous work.

use super::annotations::{
    claim_class, claim_key, get_annotation, has_annotation, ANN_DYNAMICALLY_PROVISIONED,
};
use crate::domain::ports::{ClassCache, VolumeBackend};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use tracing::{debug, error, warn};

pub const PHASE_RELEASED: &str = "Released";
pub const PHASE_FAILED: &str = "Failed";

/// Bound-volume reference of a claim, `None` while unbound
pub fn bound_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Phase of a volume, empty if no status has been reported yet
pub fn volume_phase(volume: &PersistentVolume) -> &str {
    volume
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or_default()
}

/// Should a volume be provisioned for this claim?
pub fn should_provision(
    claim: &PersistentVolumeClaim,
    classes: &dyn ClassCache,
    provisioner_name: &str,
) -> bool {
    if bound_volume_name(claim).is_some() {
        return false;
    }

    let class_name = claim_class(claim);
    let Some(class) = classes.get_class(&class_name) else {
        error!(
            claim = %claim_key(claim),
            "StorageClass {:?} not found",
            class_name
        );
        return false;
    };

    class.provisioner == provisioner_name
}

/// Phase and ownership half of [`should_delete`], without the backend lookup
pub fn may_delete(volume: &PersistentVolume, provisioner_name: &str) -> bool {
    let phase = volume_phase(volume);
    if phase != PHASE_RELEASED && phase != PHASE_FAILED {
        return false;
    }

    // Volumes without the annotation are not foreign
    !has_annotation(&volume.metadata, ANN_DYNAMICALLY_PROVISIONED)
        || get_annotation(&volume.metadata, ANN_DYNAMICALLY_PROVISIONED) == Some(provisioner_name)
}

/// Should the storage behind this volume be reclaimed?
pub async fn should_delete(
    volume: &PersistentVolume,
    provisioner_name: &str,
    backend: &dyn VolumeBackend,
) -> bool {
    if !may_delete(volume, provisioner_name) {
        return false;
    }

    let name = volume.metadata.name.as_deref().unwrap_or_default();
    match backend.exists(name).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(volume = name, "backend artifact already gone");
            false
        }
        Err(e) => {
            warn!(volume = name, "backend existence check failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{MemoryBackend, MemoryClassCache};
    use crate::controller::annotations::{set_annotation, ANN_CLASS};
    use crate::controller::testing::{claim, class, released_volume};
    use k8s_openapi::api::core::v1::PersistentVolumeStatus;

    const ME: &str = "example.com/iscsi";

    #[test]
    fn test_bound_claim_is_never_provisioned() {
        let classes = MemoryClassCache::new();
        classes.insert(class("fast", ME));

        let mut c = claim("ns", "pvc1", "u1", Some("fast"));
        assert!(should_provision(&c, &classes, ME));

        c.spec.get_or_insert_with(Default::default).volume_name = Some("pvc-u1".into());
        assert!(!should_provision(&c, &classes, ME));
    }

    #[test]
    fn test_empty_volume_name_counts_as_unbound() {
        let classes = MemoryClassCache::new();
        classes.insert(class("fast", ME));

        let mut c = claim("ns", "pvc1", "u1", Some("fast"));
        c.spec.get_or_insert_with(Default::default).volume_name = Some(String::new());
        assert!(should_provision(&c, &classes, ME));
    }

    #[test]
    fn test_foreign_class_is_not_provisioned() {
        let classes = MemoryClassCache::new();
        classes.insert(class("fast", "kubernetes.io/aws-ebs"));

        let c = claim("ns", "pvc1", "u1", Some("fast"));
        assert!(!should_provision(&c, &classes, ME));
    }

    #[test]
    fn test_missing_class_is_not_provisioned() {
        let classes = MemoryClassCache::new();
        classes.insert(class("fast", ME));

        let c = claim("ns", "pvc1", "u1", Some("missing"));
        assert!(!should_provision(&c, &classes, ME));
    }

    #[test]
    fn test_classless_claim_uses_empty_class() {
        let classes = MemoryClassCache::new();
        let c = claim("ns", "pvc1", "u1", None);
        assert!(!should_provision(&c, &classes, ME));

        classes.insert(class("", ME));
        assert!(should_provision(&c, &classes, ME));
    }

    #[tokio::test]
    async fn test_only_released_or_failed_volumes_are_deleted() {
        let backend = MemoryBackend::new();
        backend.seed("pvc-u1");

        let mut volume = released_volume("pvc-u1", Some(ME));
        assert!(should_delete(&volume, ME, &backend).await);

        volume.status = Some(PersistentVolumeStatus {
            phase: Some(PHASE_FAILED.into()),
            ..Default::default()
        });
        assert!(should_delete(&volume, ME, &backend).await);

        for phase in ["Pending", "Available", "Bound"] {
            volume.status = Some(PersistentVolumeStatus {
                phase: Some(phase.into()),
                ..Default::default()
            });
            assert!(!should_delete(&volume, ME, &backend).await, "phase {}", phase);
        }

        volume.status = None;
        assert!(!should_delete(&volume, ME, &backend).await);
    }

    #[tokio::test]
    async fn test_foreign_volume_is_not_deleted() {
        let backend = MemoryBackend::new();
        backend.seed("pvc-u1");

        let volume = released_volume("pvc-u1", Some("someone-else"));
        assert!(!should_delete(&volume, ME, &backend).await);

        // Volumes without the annotation are not foreign
        let volume = released_volume("pvc-u1", None);
        assert!(should_delete(&volume, ME, &backend).await);
    }

    #[test]
    fn test_may_delete_skips_the_backend() {
        assert!(may_delete(&released_volume("pvc-u1", Some(ME)), ME));
        assert!(may_delete(&released_volume("pvc-u1", None), ME));
        assert!(!may_delete(&released_volume("pvc-u1", Some("someone-else")), ME));

        // An empty owner is still somebody else's
        assert!(!may_delete(&released_volume("pvc-u1", Some("")), ME));
    }

    #[tokio::test]
    async fn test_already_reclaimed_volume_is_not_deleted() {
        let backend = MemoryBackend::new();
        let mut volume = released_volume("pvc-u1", Some(ME));
        set_annotation(&mut volume.metadata, ANN_CLASS, "fast");

        assert!(!should_delete(&volume, ME, &backend).await);
        assert_eq!(backend.deallocate_calls(), 0);
    }
}
