//! Shared stores
//!
//! The manifest index, incident table and rollout store are the only shared
//! mutable resources in DRX. Each is a trait with an in-memory
//! implementation; production deployments back them with a transactional
//! database.

use std::sync::Arc;

pub mod incident;
pub mod manifest;
pub mod migration;
pub mod rollout;
pub mod versions;

pub use incident::{IncidentTable, InMemoryIncidentTable};
pub use manifest::{FileManifestIndex, InMemoryManifestIndex, ManifestIndex};
pub use migration::{InMemoryMigrationLog, MigrationLog};
pub use rollout::{InMemoryRolloutStore, RolloutStore};
pub use versions::{InMemoryVersionRegistry, VersionRegistry};

/// Handles to every shared store
#[derive(Clone)]
pub struct Stores {
    pub manifests: Arc<dyn ManifestIndex>,
    pub incidents: Arc<dyn IncidentTable>,
    pub rollouts: Arc<dyn RolloutStore>,
    pub versions: Arc<dyn VersionRegistry>,
    pub migrations: Arc<dyn MigrationLog>,
}
