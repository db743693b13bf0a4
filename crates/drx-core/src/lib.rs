//! DRX Core - shared model for backup and disaster-recovery orchestration
//!
//! Provides everything the controllers have in common:
//! - The data model (jobs, manifests, incidents, rollouts, version records)
//! - The error taxonomy and retry/timeout discipline
//! - Traits for the external collaborators (artifact store, dump/restore,
//!   deployment control plane, alerting)
//! - The shared stores that act as the single source of truth
//!
//! # Example
//!
//! ```rust,ignore
//! use drx_core::prelude::*;
//!
//! let config = DrxConfig::from_toml_str(include_str!("drx.toml"))?;
//! let index = InMemoryManifestIndex::new();
//! let restore_point = index.latest_restorable("database", None).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod alert;
pub mod checksum;
pub mod config;
pub mod error;
pub mod ports;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod types;

pub use alert::{Alert, AlertCategory, AlertContext, AlertSeverity, Alerter, TracingAlerter};
pub use checksum::Checksum;
pub use config::{
    BackupConfig, BackupTarget, DrConfig, DrxConfig, DumpFormat, HealthThresholds,
    RollbackConfig, RolloutConfig, TierPolicy,
};
pub use error::{DrxError, ValidationError};
pub use ports::{ArtifactStore, Collaborators, DataDumper, DeploymentControlPlane};
pub use retry::{retry_with_backoff, with_timeout, RetryOutcome, RetryPolicy};
pub use types::{
    backup_key, BackupJob, BackupManifest, ComponentKind, ComponentRef, ComponentVersionRecord,
    DrIncident, DrLevel, DumpTarget, EnvId, EnvPurpose, EnvironmentSpec, HealthReading,
    IncidentId, IncidentStatus, IncidentTrigger, JobId, JobStatus, LevelChange, ManifestId,
    MigrationLogEntry, MigrationStatus, RolloutState, RolloutStatus, StorageClass, Tier,
    TrafficSplit, TriggerSource, ValidationFailure,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with DRX
    pub use crate::store::{
        IncidentTable, ManifestIndex, MigrationLog, RolloutStore, VersionRegistry,
        InMemoryIncidentTable, InMemoryManifestIndex, InMemoryMigrationLog,
        InMemoryRolloutStore, InMemoryVersionRegistry, Stores,
    };
    pub use crate::{
        AlertSeverity, Alerter, ArtifactStore, BackupJob, Collaborators, BackupManifest, DataDumper,
        DeploymentControlPlane, DrIncident, DrLevel, DrxConfig, DrxError, RolloutState, Tier,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
