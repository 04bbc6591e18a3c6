//! Storage Backend Adapters
//!
//! Provides the two ways of allocating iSCSI storage:
//! - Script: operator-supplied shell scripts
//! - REST: a storage-management HTTP server

pub mod rest;
pub mod script;

pub use rest::{RestBackend, RestConfig};
pub use script::{ScriptBackend, ScriptConfig};

use crate::config::{BackendConfig, OperationMode};
use crate::domain::ports::VolumeBackend;
use crate::error::Result;
use std::sync::Arc;

/// Factory for creating storage backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Create the backend for the configured operation mode
    pub fn create(config: &BackendConfig) -> Result<Arc<dyn VolumeBackend>> {
        match config.mode {
            OperationMode::Script => Ok(Arc::new(ScriptBackend::new(ScriptConfig::from_backend(
                config,
            )?))),
            OperationMode::RestApi => Ok(Arc::new(RestBackend::new(RestConfig::from_backend(
                config,
            ))?)),
        }
    }
}
