//! Provisioning controller
//!
//! Decides which claims need a volume and which volumes need reclaiming,
//! deduplicates the resulting operations per resource, and runs the
//! provisioning and deletion state machines.

pub mod annotations;
pub mod delete;
pub mod predicates;
pub mod provision;
pub mod reconciler;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use annotations::*;
pub use delete::DeleteOutcome;
pub use predicates::{may_delete, should_delete, should_provision};
pub use provision::ProvisionOutcome;
pub use reconciler::{ControllerContext, ProvisionController};
pub use scheduler::OperationScheduler;
