//! iSCSI Provisioner - Dynamic PersistentVolume provisioning for Kubernetes
//!
//! Watches PersistentVolumeClaims whose StorageClass names this provisioner,
//! allocates iSCSI storage through a pluggable backend and publishes a
//! matching PersistentVolume. Released volumes with a `Delete` reclaim policy
//! are reclaimed from the backend and removed.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          Watch Adapter                              │
//! │      claims / volumes / classes (reflectors + periodic resync)      │
//! └───────────────────────────────┬────────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┴────────────────────────────────────┐
//! │                       Provision Controller                          │
//! │  ┌──────────────┐  ┌────────────────────┐  ┌─────────────────────┐  │
//! │  │  Predicates  │  │ Operation Scheduler│  │   State Machines    │  │
//! │  │              │  │  (one op per key)  │  │ provision / delete  │  │
//! │  └──────────────┘  └────────────────────┘  └─────────────────────┘  │
//! └───────────────────────────────┬────────────────────────────────────┘
//!                                 │
//! ┌──────────────────┬────────────┴───────────┬───────────────────────┐
//! │  Volume Store    │     Event Sink         │   Storage Backend     │
//! │  (API server)    │  (kube events)         │   (script / REST)     │
//! └──────────────────┴────────────────────────┴───────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Predicates, scheduler and state machines
//! - [`cluster`]: Kubernetes and in-memory adapters, watch adapter
//! - [`backends`]: Script and REST storage backends
//! - [`domain`]: Port traits and value types
//! - [`config`]: Provisioner configuration
//! - [`metrics`], [`server`]: Prometheus metrics and the health server
//! - [`error`]: Error types and handling

pub mod backends;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod server;

// Re-export commonly used types
pub use backends::{BackendFactory, RestBackend, ScriptBackend};

pub use cluster::{KubeEventRecorder, KubeVolumeStore, WatchAdapter};

pub use config::{BackendConfig, OperationMode, ProvisionerConfig};

pub use controller::{
    should_delete, should_provision, ControllerContext, DeleteOutcome, OperationScheduler,
    ProvisionController, ProvisionOutcome,
};

pub use domain::ports::{
    AllocatedVolume, ClassCache, EventRecorder, EventSeverity, VolumeBackend, VolumeOptions,
    VolumeStore,
};

pub use error::{Error, ErrorClass, Result};

pub use metrics::Metrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
