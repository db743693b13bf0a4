//! DRX configuration
//!
//! All durations are whole seconds so the file format stays plain TOML.

use crate::error::DrxError;
use crate::retry::RetryPolicy;
use crate::types::{ComponentKind, EnvId, HealthReading, StorageClass, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const HOUR: u64 = 3_600;
const DAY: u64 = 24 * HOUR;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DrxConfig {
    pub backup: BackupConfig,
    pub rollback: RollbackConfig,
    pub rollout: RolloutConfig,
    pub dr: DrConfig,
}

impl DrxConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// `DrxError::Config` on parse or validation failure.
    pub fn from_toml_str(input: &str) -> Result<Self, DrxError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    /// `DrxError::Config` naming the offending field.
    pub fn validate(&self) -> Result<(), DrxError> {
        for (tier, policy) in &self.backup.tiers {
            if policy.cadence_secs == 0 {
                return Err(DrxError::Config(format!("{tier}: cadence must be > 0")));
            }
            if policy.retention_secs < policy.cadence_secs {
                return Err(DrxError::Config(format!(
                    "{tier}: retention shorter than cadence"
                )));
            }
        }
        if self.backup.retry.max_attempts == 0 {
            return Err(DrxError::Config("backup.retry.max_attempts must be > 0".into()));
        }
        if self.rollout.step_percent == 0 || self.rollout.step_percent > 100 {
            return Err(DrxError::Config("rollout.step_percent must be 1-100".into()));
        }
        if self.rollout.required_healthy_polls == 0 {
            return Err(DrxError::Config(
                "rollout.required_healthy_polls must be > 0".into(),
            ));
        }
        if self.dr.recovery_traffic_percent == 0 || self.dr.recovery_traffic_percent >= 50 {
            return Err(DrxError::Config(
                "dr.recovery_traffic_percent must be a minority share (1-49)".into(),
            ));
        }
        if self.dr.level1_health_attempts == 0 {
            return Err(DrxError::Config("dr.level1_health_attempts must be > 0".into()));
        }
        let timeouts = [
            ("backup", self.backup.operation_timeout_secs),
            ("rollback", self.rollback.operation_timeout_secs),
            ("rollout", self.rollout.operation_timeout_secs),
            ("dr", self.dr.operation_timeout_secs),
        ];
        if let Some((section, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(DrxError::Config(format!(
                "{section}.operation_timeout_secs must be > 0"
            )));
        }
        if self.dr.primary_region == self.dr.secondary_region {
            return Err(DrxError::Config(
                "dr.secondary_region must differ from dr.primary_region".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn with_backup_target(mut self, target: BackupTarget) -> Self {
        self.backup.targets.push(target);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_monitored_component(mut self, component: impl Into<String>) -> Self {
        self.dr.monitored_components.push(component.into());
        self
    }
}

/// Cadence, retention and storage class of one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub cadence_secs: u64,
    pub retention_secs: u64,
    pub storage_class: StorageClass,
}

impl TierPolicy {
    #[inline]
    #[must_use]
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }

    #[inline]
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Defaults: hot 4h/2d, warm 1d/30d, cold 7d/365d, geo 1d/90d
    #[must_use]
    pub fn default_for(tier: Tier) -> Self {
        let (cadence_secs, retention_secs) = match tier {
            Tier::Hot => (4 * HOUR, 2 * DAY),
            Tier::Warm => (DAY, 30 * DAY),
            Tier::Cold => (7 * DAY, 365 * DAY),
            Tier::Geo => (DAY, 90 * DAY),
        };
        Self {
            cadence_secs,
            retention_secs,
            storage_class: tier.default_storage_class(),
        }
    }
}

/// Encoding of a component's dump, used by the validator's structure pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    /// No structure check
    #[default]
    Opaque,
    Json,
    Sql,
}

/// A component whose state is backed up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub component: String,
    #[serde(default)]
    pub kind: ComponentKind,
    #[serde(default)]
    pub format: DumpFormat,
}

impl BackupTarget {
    #[must_use]
    pub fn new(component: impl Into<String>, kind: ComponentKind, format: DumpFormat) -> Self {
        Self {
            component: component.into(),
            kind,
            format,
        }
    }
}

/// Backup scheduler and validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub tiers: BTreeMap<Tier, TierPolicy>,
    pub targets: Vec<BackupTarget>,
    pub retry: RetryPolicy,
    /// Deadline for each dump, upload or download
    pub operation_timeout_secs: u64,
}

impl BackupConfig {
    /// Policy for `tier`, falling back to the built-in default
    #[must_use]
    pub fn policy(&self, tier: Tier) -> TierPolicy {
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or_else(|| TierPolicy::default_for(tier))
    }

    #[inline]
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Declared format of a component's dump
    #[must_use]
    pub fn format_of(&self, component: &str) -> DumpFormat {
        self.targets
            .iter()
            .find(|t| t.component == component)
            .map(|t| t.format)
            .unwrap_or_default()
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            tiers: Tier::ALL
                .iter()
                .map(|t| (*t, TierPolicy::default_for(*t)))
                .collect(),
            targets: Vec::new(),
            retry: RetryPolicy::default(),
            operation_timeout_secs: 600,
        }
    }
}

/// Health gate shared by rollouts, smoke tests and DR checks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub max_error_rate: f64,
    pub max_p95_latency_ms: f64,
    /// Maximum tolerated provider-performance regression
    pub max_provider_delta: f64,
}

impl HealthThresholds {
    /// Reading is within every threshold
    #[must_use]
    pub fn is_healthy(&self, reading: &HealthReading) -> bool {
        self.violation(reading).is_none()
    }

    /// First threshold the reading violates, if any
    ///
    /// A non-finite value is a violation: a broken metrics feed never reads
    /// as healthy.
    #[must_use]
    pub fn violation(&self, reading: &HealthReading) -> Option<String> {
        if !reading.error_rate.is_finite() {
            return Some(format!("error rate unreadable ({})", reading.error_rate));
        }
        if !reading.p95_latency_ms.is_finite() {
            return Some(format!("p95 latency unreadable ({})", reading.p95_latency_ms));
        }
        if reading.error_rate > self.max_error_rate {
            return Some(format!(
                "error rate {:.2}% above {:.2}%",
                reading.error_rate * 100.0,
                self.max_error_rate * 100.0
            ));
        }
        if reading.p95_latency_ms > self.max_p95_latency_ms {
            return Some(format!(
                "p95 latency {:.0}ms above {:.0}ms",
                reading.p95_latency_ms, self.max_p95_latency_ms
            ));
        }
        match reading.provider_delta {
            Some(delta) if !delta.is_finite() => {
                Some(format!("provider delta unreadable ({delta})"))
            }
            Some(delta) if delta > self.max_provider_delta => Some(format!(
                "provider delta {delta:.3} above {:.3}",
                self.max_provider_delta
            )),
            _ => None,
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_p95_latency_ms: 2_000.0,
            max_provider_delta: 0.20,
        }
    }
}

/// Rollback manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub operation_timeout_secs: u64,
    /// Roll back independent components of one layer concurrently
    pub parallel: bool,
    pub smoke_test: HealthThresholds,
    /// Key prefix for safety snapshots in the artifact store
    pub safety_prefix: String,
}

impl RollbackConfig {
    #[inline]
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 300,
            parallel: false,
            smoke_test: HealthThresholds::default(),
            safety_prefix: "safety".to_string(),
        }
    }
}

/// Traffic-shifting controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub step_percent: u8,
    /// Dwell between increments
    pub dwell_secs: u64,
    pub poll_interval_secs: u64,
    pub required_healthy_polls: u32,
    pub thresholds: HealthThresholds,
    /// Reverts of one component before a Level-1 trigger is raised
    pub revert_escalation_threshold: u32,
    pub operation_timeout_secs: u64,
}

impl RolloutConfig {
    #[inline]
    #[must_use]
    pub fn dwell(&self) -> Duration {
        Duration::from_secs(self.dwell_secs)
    }

    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[inline]
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            step_percent: 10,
            dwell_secs: 300,
            poll_interval_secs: 30,
            required_healthy_polls: 3,
            thresholds: HealthThresholds::default(),
            revert_escalation_threshold: 3,
            operation_timeout_secs: 30,
        }
    }
}

/// DR escalation controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrConfig {
    /// Environment serving production traffic
    pub primary_env: EnvId,
    pub primary_region: String,
    pub secondary_region: String,
    /// Share of traffic sent to a Level-2 recovery environment
    pub recovery_traffic_percent: u8,
    /// Health checks after a Level-1 restart before escalating
    pub level1_health_attempts: u32,
    pub health_poll_interval_secs: u64,
    pub operation_timeout_secs: u64,
    pub thresholds: HealthThresholds,
    /// Components covered by the health-poll loop and full-stack failover
    pub monitored_components: Vec<String>,
}

impl DrConfig {
    #[inline]
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_interval_secs)
    }
}

impl Default for DrConfig {
    fn default() -> Self {
        Self {
            primary_env: EnvId::new("primary"),
            primary_region: "us-east-1".to_string(),
            secondary_region: "us-west-2".to_string(),
            recovery_traffic_percent: 10,
            level1_health_attempts: 2,
            health_poll_interval_secs: 60,
            operation_timeout_secs: 120,
            thresholds: HealthThresholds::default(),
            monitored_components: Vec::new(),
        }
    }
}
