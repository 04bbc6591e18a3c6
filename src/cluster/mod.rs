//! Cluster adapters
//!
//! Implementations of the domain ports against the Kubernetes API
//! ([`kubernetes`], [`watch`]) and in process memory ([`memory`]).

pub mod kubernetes;
pub mod memory;
pub mod watch;

pub use kubernetes::{KubeEventRecorder, KubeVolumeStore};
pub use memory::{MemoryBackend, MemoryClassCache, MemoryVolumeStore, RecordingEventSink};
pub use watch::{ResourceEventHandler, WatchAdapter};
