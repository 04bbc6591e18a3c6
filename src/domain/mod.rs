//! Domain layer - Port definitions
//!
//! This module defines the core traits (ports) that the cluster and backend
//! adapters implement, following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
