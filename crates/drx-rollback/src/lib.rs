//! DRX Rollback - dependency-ordered rollback with safety snapshots
//!
//! - [`DependencyGraph`]: component "depends on" graph with deterministic
//!   ordering
//! - [`RollbackManager`]: snapshot, roll back, smoke-test, restore on failure

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod graph;
pub mod manager;

pub use graph::{DependencyGraph, GraphError};
pub use manager::{ComponentRollback, RollbackManager, RollbackReport, RollbackStatus};
