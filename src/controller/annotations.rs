//! Ownership and class bookkeeping
//!
//! Annotation helpers that record which provisioner created a volume and
//! which StorageClass a claim or volume belongs to, plus the naming helpers
//! that make provisioning idempotent across restarts.

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// StorageClass of a resource. On a claim it selects the class to provision
/// from; on a volume it records the class the volume was provisioned for.
pub const ANN_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

/// Name of the provisioner that dynamically provisioned a volume
pub const ANN_DYNAMICALLY_PROVISIONED: &str = "pv.kubernetes.io/provisioned-by";

/// Informational marker on every volume this provisioner builds
pub const ANN_CREATED_BY: &str = "kubernetes.io/createdby";

/// Value of [`ANN_CREATED_BY`]
pub const CREATED_BY: &str = "iscsi-dynamic-provisioner";

/// Prefix of provisioned volume names
pub const VOLUME_NAME_PREFIX: &str = "pvc-";

pub fn has_annotation(meta: &ObjectMeta, key: &str) -> bool {
    meta.annotations
        .as_ref()
        .map_or(false, |anns| anns.contains_key(key))
}

pub fn get_annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|anns| anns.get(key))
        .map(String::as_str)
}

/// Set an annotation, creating the annotation map if absent
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: impl Into<String>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.into());
}

/// Name of the class requested by a claim.
///
/// The beta annotation wins over `spec.storageClassName`; a claim with
/// neither requests class `""`.
pub fn claim_class(claim: &PersistentVolumeClaim) -> String {
    if let Some(class) = get_annotation(&claim.metadata, ANN_CLASS) {
        return class.to_string();
    }
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.clone())
        .unwrap_or_default()
}

/// `namespace/name` of a claim
pub fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!(
        "{}/{}",
        claim.metadata.namespace.as_deref().unwrap_or_default(),
        claim.metadata.name.as_deref().unwrap_or_default()
    )
}

/// `namespace/name` of a claim reference
pub fn claim_ref_key(reference: &ObjectReference) -> String {
    format!(
        "{}/{}",
        reference.namespace.as_deref().unwrap_or_default(),
        reference.name.as_deref().unwrap_or_default()
    )
}

/// Deterministic volume name for a claim, unique per claim UID
pub fn provisioned_volume_name(claim: &PersistentVolumeClaim) -> String {
    format!(
        "{}{}",
        VOLUME_NAME_PREFIX,
        claim.metadata.uid.as_deref().unwrap_or_default()
    )
}
