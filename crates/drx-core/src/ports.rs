//! External collaborators
//!
//! The core never talks to object storage, databases or the deployment API
//! directly; it consumes these traits. Implementations must return
//! [`DrxError::TransientIo`] for blips worth retrying and
//! [`DrxError::NotFound`] for missing keys.

use crate::alert::Alerter;
use crate::error::DrxError;
use crate::types::{DumpTarget, EnvId, EnvironmentSpec, HealthReading, StorageClass, TrafficSplit};
use async_trait::async_trait;
use std::sync::Arc;

/// Object store holding backup and safety-snapshot artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload bytes under `key`
    async fn put(&self, key: &str, bytes: Vec<u8>, class: StorageClass) -> Result<(), DrxError>;

    /// Download the bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, DrxError>;

    /// Keys starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, DrxError>;

    /// Remove `key`
    async fn delete(&self, key: &str) -> Result<(), DrxError>;
}

/// Structured-data dump/restore for a component's state
#[async_trait]
pub trait DataDumper: Send + Sync {
    /// Serialize the target's current state
    async fn dump(&self, target: &DumpTarget) -> Result<Vec<u8>, DrxError>;

    /// Replace the target's state with `bytes`
    async fn restore(&self, target: &DumpTarget, bytes: &[u8]) -> Result<(), DrxError>;
}

/// Compute/deployment control plane
#[async_trait]
pub trait DeploymentControlPlane: Send + Sync {
    /// Provision a new environment
    async fn create_environment(&self, spec: &EnvironmentSpec) -> Result<EnvId, DrxError>;

    /// Deploy `version` of `component` into `env`
    async fn deploy_artifact(
        &self,
        env: &EnvId,
        component: &str,
        version: &str,
    ) -> Result<(), DrxError>;

    /// Route a component's traffic across environments
    async fn set_traffic_split(&self, component: &str, split: &TrafficSplit)
        -> Result<(), DrxError>;

    /// Tear an environment down
    async fn delete_environment(&self, env: &EnvId) -> Result<(), DrxError>;

    /// Aggregate health of an environment
    async fn health_check(&self, env: &EnvId) -> Result<HealthReading, DrxError>;

    /// Restart/rescale a component in place
    async fn restart_component(&self, env: &EnvId, component: &str) -> Result<(), DrxError>;
}

/// Handles to every external collaborator, shared by the controllers
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ArtifactStore>,
    pub dumper: Arc<dyn DataDumper>,
    pub control: Arc<dyn DeploymentControlPlane>,
    pub alerter: Arc<dyn Alerter>,
}
