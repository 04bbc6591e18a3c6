//! Error types for the iSCSI provisioner
//!
//! Provides structured error types for the provisioning engine, the storage
//! backends, the Kubernetes adapters and process bootstrap.

use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Invalid object reference for {kind}: missing {field}")]
    InvalidReference { kind: String, field: String },

    #[error("StorageClass not found: {name:?}")]
    StorageClassNotFound { name: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Unexpected backend output from {backend}: expected 2 fields, got {fields}")]
    BackendOutput { backend: String, fields: usize },

    #[error("Backend HTTP error: {0}")]
    BackendHttp(#[from] reqwest::Error),

    // =========================================================================
    // Orphaned Storage
    // =========================================================================
    #[error("Orphaned volume {volume_name}: backend storage exists without a PersistentVolume")]
    OrphanedVolume { volume_name: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the provisioner treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// External call failed; the next reconciliation pass retries
    Transient,
    /// Missing class, malformed reference or bad configuration; the attempt
    /// is aborted without retry
    Lookup,
    /// Backend storage exists without a record; needs an operator
    Orphan,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::OrphanedVolume { .. } => ErrorClass::Orphan,

            Error::Configuration(_)
            | Error::Kubeconfig(_)
            | Error::InvalidReference { .. }
            | Error::StorageClassNotFound { .. }
            | Error::YamlParse(_) => ErrorClass::Lookup,

            _ => ErrorClass::Transient,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Check if this is a 409 from the API server
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Check if this is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
