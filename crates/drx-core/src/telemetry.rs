//! Tracing setup and metric names

use crate::error::DrxError;
use tracing_subscriber::EnvFilter;

/// Backup jobs by `tier` and `outcome`
pub const BACKUP_JOBS_TOTAL: &str = "drx_backup_jobs_total";
/// Validator verdicts by `tier` and `outcome`
pub const BACKUP_VALIDATIONS_TOTAL: &str = "drx_backup_validations_total";
/// Manifests expired by the retention sweeper
pub const MANIFESTS_EXPIRED_TOTAL: &str = "drx_manifests_expired_total";
/// Component rollbacks by `outcome`
pub const ROLLBACKS_TOTAL: &str = "drx_rollbacks_total";
/// Rollout full reverts by `component`
pub const ROLLOUT_REVERTS_TOTAL: &str = "drx_rollout_reverts_total";
/// Incident level transitions by `level`
pub const INCIDENT_TRANSITIONS_TOTAL: &str = "drx_incident_transitions_total";

/// Install the global tracing subscriber
///
/// Honors `RUST_LOG`, defaulting to `info`. `json` switches to
/// machine-readable output.
///
/// # Errors
/// `DrxError::Config` if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> Result<(), DrxError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| DrxError::Config(format!("tracing already initialised: {e}")))
}
