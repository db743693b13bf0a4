//! Error taxonomy for DRX
//!
//! Every failure the orchestration core can produce maps to one of these
//! variants. The retry helpers only retry [`DrxError::is_retryable`] errors;
//! everything else is surfaced to the next level up (scheduler alert,
//! DR escalation, rollout revert).

use crate::alert::AlertCategory;
use crate::types::{DrLevel, IncidentId};

/// Main DRX error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DrxError {
    /// Network or storage blip; retried with backoff
    #[error("transient I/O failure during {operation}: {message}")]
    TransientIo {
        /// Operation that failed
        operation: String,
        /// Underlying failure
        message: String,
    },

    /// Backup missing or present but failing its integrity check
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Cyclic or unresolved component dependency
    #[error("dependency order error: {0}")]
    DependencyOrder(String),

    /// Pre-rollback snapshot could not be taken or persisted
    #[error("safety snapshot failed for {component}: {reason}")]
    SafetySnapshotFailure {
        /// Component being rolled back
        component: String,
        /// Why the snapshot failed
        reason: String,
    },

    /// Rollback applied but did not pass its smoke test, or could not be
    /// applied; the component was restored from its safety snapshot
    #[error("rollback of {component} failed: {reason}")]
    RollbackFailed {
        /// Component being rolled back
        component: String,
        /// What went wrong
        reason: String,
    },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline in milliseconds
        after_ms: u64,
    },

    /// Second active incident, overlapping job, or concurrent rollout
    #[error("concurrency violation: {0}")]
    ConcurrencyViolation(String),

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Automation halted pending human sign-off
    #[error("automation frozen by incident {incident}")]
    AutomationFrozen {
        /// Incident holding the freeze
        incident: IncidentId,
    },

    /// Illegal DR level or status transition
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current level
        from: DrLevel,
        /// Requested level
        to: DrLevel,
    },

    /// Stale compare-and-swap write
    #[error("stale write: expected revision {expected}, found {found}")]
    StaleRevision {
        /// Revision the writer read
        expected: u64,
        /// Revision currently stored
        found: u64,
    },

    /// Cancelled by operator action
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Encoding or decoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local persistence failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl DrxError {
    /// Build a transient I/O error
    #[inline]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientIo {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. } | Self::Timeout { .. })
    }

    /// Check if the error counts as a failed step for escalation purposes
    ///
    /// Timeouts are never success-by-default.
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Alert category used when this error reaches a terminal state
    #[must_use]
    pub fn alert_category(&self) -> AlertCategory {
        match self {
            Self::TransientIo { .. } => AlertCategory::TransientIo,
            Self::Validation(ValidationError::Missing { .. }) => AlertCategory::BackupMissing,
            Self::Validation(_) => AlertCategory::Validation,
            Self::DependencyOrder(_) => AlertCategory::DependencyOrder,
            Self::SafetySnapshotFailure { .. } => AlertCategory::SafetySnapshot,
            Self::RollbackFailed { .. } => AlertCategory::RollbackFailed,
            Self::Timeout { .. } => AlertCategory::Timeout,
            Self::ConcurrencyViolation(_) | Self::StaleRevision { .. } => {
                AlertCategory::Concurrency
            }
            Self::AutomationFrozen { .. } => AlertCategory::ManualIntervention,
            Self::NotFound(_)
            | Self::InvalidTransition { .. }
            | Self::Cancelled
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Storage(_) => AlertCategory::Internal,
        }
    }
}

impl From<serde_json::Error> for DrxError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<toml::de::Error> for DrxError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<std::io::Error> for DrxError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

/// Backup integrity failures
///
/// `Missing` and the corrupt variants are deliberately distinct: a missing
/// backup produces no manifest, a corrupt one produces an unvalidated manifest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Artifact absent from the store
    #[error("backup missing at {key}")]
    Missing {
        /// Storage key
        key: String,
    },

    /// Recomputed checksum differs from the recorded one
    #[error("checksum mismatch at {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Storage key
        key: String,
        /// Checksum recorded at upload
        expected: String,
        /// Checksum recomputed on download
        actual: String,
    },

    /// Structured dump failed its sanity pass
    #[error("malformed backup at {key}: {reason}")]
    Malformed {
        /// Storage key
        key: String,
        /// Parser diagnostic
        reason: String,
    },

    /// Job never reached the uploaded state
    #[error("job {0} has no uploaded artifact")]
    NotUploaded(String),
}

impl ValidationError {
    /// Backup exists but its content cannot be trusted
    #[inline]
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::Malformed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(DrxError::transient("put", "connection reset").is_retryable());
        assert!(DrxError::Timeout {
            operation: "get".into(),
            after_ms: 10
        }
        .is_retryable());
        assert!(!DrxError::DependencyOrder("cycle".into()).is_retryable());
        assert!(!DrxError::SafetySnapshotFailure {
            component: "db".into(),
            reason: "disk full".into()
        }
        .is_retryable());
    }

    #[test]
    fn missing_and_corrupt_map_to_distinct_categories() {
        let missing = DrxError::from(ValidationError::Missing { key: "hot/db/1".into() });
        let corrupt = DrxError::from(ValidationError::ChecksumMismatch {
            key: "hot/db/1".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        });

        assert_eq!(missing.alert_category(), AlertCategory::BackupMissing);
        assert_eq!(corrupt.alert_category(), AlertCategory::Validation);
    }

    #[test]
    fn timeout_counts_as_failure() {
        let err = DrxError::Timeout {
            operation: "health_check".into(),
            after_ms: 5_000,
        };
        assert!(err.is_failure());
        assert!(!DrxError::Cancelled.is_failure());
    }

    #[test]
    fn display_messages() {
        let err = DrxError::ConcurrencyViolation("incident already active".into());
        assert!(err.to_string().contains("concurrency violation"));
    }
}
