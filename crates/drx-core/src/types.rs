//! Core types for DRX
//!
//! Defines the records shared by every controller:
//! - Backup jobs and manifests
//! - Component version records and the migration log
//! - DR incidents and their levels
//! - Rollout state for gradual traffic shifting
//! - Environment and health descriptors exchanged with the control plane

use crate::checksum::Checksum;
use crate::error::DrxError;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a new identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// Unique backup job identifier (ULID for sortability)
    JobId
);
ulid_id!(
    /// Unique manifest identifier
    ManifestId
);
ulid_id!(
    /// Unique DR incident identifier
    IncidentId
);

/// Backup cadence/retention class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Frequent, short retention
    Hot,
    /// Daily
    Warm,
    /// Weekly, long retention
    Cold,
    /// Replicated to the secondary region
    Geo,
}

impl Tier {
    /// All tiers, hottest first
    pub const ALL: [Tier; 4] = [Tier::Hot, Tier::Warm, Tier::Cold, Tier::Geo];

    /// Key prefix used in the artifact store
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
            Tier::Geo => "geo",
        }
    }

    /// Storage class used when no policy overrides it
    #[inline]
    #[must_use]
    pub const fn default_storage_class(&self) -> StorageClass {
        match self {
            Tier::Hot => StorageClass::Standard,
            Tier::Warm => StorageClass::InfrequentAccess,
            Tier::Cold => StorageClass::Archive,
            Tier::Geo => StorageClass::GeoReplicated,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = DrxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            "geo" => Ok(Tier::Geo),
            other => Err(DrxError::Config(format!("unknown tier: {other}"))),
        }
    }
}

/// Object-store storage class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Standard,
    InfrequentAccess,
    Archive,
    GeoReplicated,
}

/// Artifact store key for a backup: `{tier}/{component}/{timestamp}`
#[must_use]
pub fn backup_key(tier: Tier, component: &str, at: DateTime<Utc>) -> String {
    format!("{}/{}/{}", tier.as_str(), component, at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Backup job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Uploaded,
    Failed,
}

/// One backup of one component for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    pub id: JobId,
    pub tier: Tier,
    pub component: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Key the artifact was uploaded under
    pub storage_key: Option<String>,
    /// Checksum of the uploaded bytes
    pub checksum: Option<Checksum>,
    pub size_bytes: u64,
    pub attempts: u32,
    /// Set once the validator confirmed the upload
    pub validated: bool,
    pub error: Option<String>,
}

impl BackupJob {
    /// Create a pending job
    #[must_use]
    pub fn new(tier: Tier, component: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tier,
            component: component.into(),
            scheduled_at,
            status: JobStatus::Pending,
            storage_key: None,
            checksum: None,
            size_bytes: 0,
            attempts: 0,
            validated: false,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    pub fn mark_uploaded(&mut self, key: String, checksum: Checksum, size_bytes: u64) {
        self.status = JobStatus::Uploaded;
        self.storage_key = Some(key);
        self.checksum = Some(checksum);
        self.size_bytes = size_bytes;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
    }

    /// Job still occupies its (component, tier) slot
    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }

    /// Terminal on validator confirmation or failure
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status == JobStatus::Failed || self.validated
    }
}

/// Why a manifest failed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFailure {
    ChecksumMismatch { expected: String, actual: String },
    Malformed { reason: String },
}

/// Record describing one uploaded backup artifact
///
/// Only manifests with `validated_at` set are restore candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub id: ManifestId,
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub tier: Tier,
    pub timestamp: DateTime<Utc>,
    pub components: BTreeSet<String>,
    pub size_bytes: u64,
    pub checksum: Checksum,
    pub storage_location: String,
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ValidationFailure>,
}

impl BackupManifest {
    /// Selectable as a restore point
    #[inline]
    #[must_use]
    pub fn is_restorable(&self) -> bool {
        self.validated_at.is_some()
    }

    /// Manifest covers the component
    #[inline]
    #[must_use]
    pub fn includes(&self, component: &str) -> bool {
        self.components.contains(component)
    }
}

/// What a component is, which decides how it is rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    #[default]
    Service,
    DataStore,
    Function,
}

/// `name@version` reference
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    pub version: String,
}

impl ComponentRef {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for ComponentRef {
    type Err = DrxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(Self::new(name, version))
            }
            _ => Err(DrxError::Config(format!("invalid component reference: {s}"))),
        }
    }
}

/// Deployed version of one component
///
/// Records are append-only; a rollback appends a new record pointing at the
/// prior version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionRecord {
    pub component_name: String,
    pub current_version: String,
    pub deployed_at: DateTime<Utc>,
    pub dependencies: IndexSet<ComponentRef>,
    pub rollback_target: Option<String>,
    #[serde(default)]
    pub kind: ComponentKind,
}

impl ComponentVersionRecord {
    #[must_use]
    pub fn new(
        component_name: impl Into<String>,
        current_version: impl Into<String>,
        deployed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            component_name: component_name.into(),
            current_version: current_version.into(),
            deployed_at,
            dependencies: IndexSet::new(),
            rollback_target: None,
            kind: ComponentKind::Service,
        }
    }

    #[must_use]
    pub fn with_dependency(mut self, dep: ComponentRef) -> Self {
        self.dependencies.insert(dep);
        self
    }

    #[must_use]
    pub fn with_rollback_target(mut self, version: impl Into<String>) -> Self {
        self.rollback_target = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ComponentKind) -> Self {
        self.kind = kind;
        self
    }

    /// Names of the components this one depends on
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.name.as_str())
    }
}

/// Migration log entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Started,
    Completed,
    Failed,
}

/// Audit record for one phase of work on a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationLogEntry {
    pub component: String,
    pub phase: String,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl MigrationLogEntry {
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == MigrationStatus::Started
    }
}

/// DR severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DrLevel {
    /// Level 1: elevated latency/errors, restart in place
    ServiceDegradation,
    /// Level 2: outage, recover into a parallel environment
    ServiceOutage,
    /// Level 3: regional loss, fail over to the secondary region
    RegionalLoss,
    /// Level 4: automation halts, humans take over
    Catastrophic,
}

impl DrLevel {
    /// Numeric level 1-4
    #[inline]
    #[must_use]
    pub const fn as_u8(&self) -> u8 {
        match self {
            DrLevel::ServiceDegradation => 1,
            DrLevel::ServiceOutage => 2,
            DrLevel::RegionalLoss => 3,
            DrLevel::Catastrophic => 4,
        }
    }

    /// Next level up, `None` at level 4
    #[inline]
    #[must_use]
    pub const fn next(&self) -> Option<DrLevel> {
        match self {
            DrLevel::ServiceDegradation => Some(DrLevel::ServiceOutage),
            DrLevel::ServiceOutage => Some(DrLevel::RegionalLoss),
            DrLevel::RegionalLoss => Some(DrLevel::Catastrophic),
            DrLevel::Catastrophic => None,
        }
    }
}

impl From<DrLevel> for u8 {
    fn from(level: DrLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for DrLevel {
    type Error = DrxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DrLevel::ServiceDegradation),
            2 => Ok(DrLevel::ServiceOutage),
            3 => Ok(DrLevel::RegionalLoss),
            4 => Ok(DrLevel::Catastrophic),
            other => Err(DrxError::Config(format!("DR level out of range: {other}"))),
        }
    }
}

impl fmt::Display for DrLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.as_u8())
    }
}

/// Incident status
///
/// `Escalated` means the incident reached level 4 and is waiting for a human
/// to resolve it. Both `Active` and `Escalated` hold the singleton slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Active,
    Resolved,
    Escalated,
}

/// Where a failure signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Monitoring,
    HealthPoll,
    RolloutReverts,
    Operator,
}

/// Failure signal that opens or feeds an incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentTrigger {
    pub components: Vec<String>,
    pub reason: String,
    pub source: TriggerSource,
    /// Severity the signal indicates at creation time
    pub level: DrLevel,
}

impl IncidentTrigger {
    #[must_use]
    pub fn new(
        components: Vec<String>,
        reason: impl Into<String>,
        source: TriggerSource,
        level: DrLevel,
    ) -> Self {
        Self {
            components,
            reason: reason.into(),
            source,
            level,
        }
    }
}

/// One level transition in an incident's lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelChange {
    pub level: DrLevel,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// A DR incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrIncident {
    pub id: IncidentId,
    pub level: DrLevel,
    pub trigger: IncidentTrigger,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: IncidentStatus,
    /// Compare-and-swap counter, bumped on every stored write
    #[serde(default)]
    pub revision: u64,
    /// Triggers received while this incident was open
    #[serde(default)]
    pub evidence: Vec<IncidentTrigger>,
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub automation_frozen: bool,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub level_history: Vec<LevelChange>,
}

impl DrIncident {
    /// New active incident at the trigger's level
    #[must_use]
    pub fn open(trigger: IncidentTrigger, now: DateTime<Utc>) -> Self {
        let level = trigger.level;
        let reason = trigger.reason.clone();
        Self {
            id: IncidentId::new(),
            level,
            trigger,
            opened_at: now,
            resolved_at: None,
            status: IncidentStatus::Active,
            revision: 0,
            evidence: Vec::new(),
            annotations: Vec::new(),
            automation_frozen: false,
            resolved_by: None,
            level_history: vec![LevelChange {
                level,
                at: now,
                reason,
            }],
        }
    }

    /// Holds the singleton active slot
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status != IncidentStatus::Resolved
    }

    /// Move to a strictly higher level
    ///
    /// # Errors
    /// `InvalidTransition` if `to` is not above the current level or the
    /// incident is resolved.
    pub fn escalate_to(
        &mut self,
        to: DrLevel,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DrxError> {
        if !self.is_open() || to <= self.level {
            return Err(DrxError::InvalidTransition {
                from: self.level,
                to,
            });
        }
        self.level = to;
        self.level_history.push(LevelChange {
            level: to,
            at: now,
            reason: reason.into(),
        });
        if to == DrLevel::Catastrophic {
            self.status = IncidentStatus::Escalated;
            self.automation_frozen = true;
        }
        Ok(())
    }

    /// Close the incident
    pub fn resolve(&mut self, by: impl Into<String>, now: DateTime<Utc>) {
        self.status = IncidentStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolved_by = Some(by.into());
        self.automation_frozen = false;
    }
}

/// Rollout status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutStatus {
    Progressing,
    Completed,
    Reverted,
    Cancelled,
}

/// Gradual exposure state of one component
///
/// `current_percentage` only moves up, except for single-step resets to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutState {
    pub component_name: String,
    pub current_percentage: u8,
    pub target_percentage: u8,
    pub last_step_at: DateTime<Utc>,
    pub consecutive_healthy_checks: u32,
    pub status: RolloutStatus,
    pub candidate_env: EnvId,
    pub stable_env: EnvId,
    #[serde(default)]
    pub revert_count: u32,
    #[serde(default)]
    pub revision: u64,
}

impl RolloutState {
    /// Fresh rollout at 0%
    #[must_use]
    pub fn new(
        component_name: impl Into<String>,
        candidate_env: EnvId,
        stable_env: EnvId,
        target_percentage: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            component_name: component_name.into(),
            current_percentage: 0,
            target_percentage: target_percentage.min(100),
            last_step_at: now,
            consecutive_healthy_checks: 0,
            status: RolloutStatus::Progressing,
            candidate_env,
            stable_env,
            revert_count: 0,
            revision: 0,
        }
    }

    /// Next exposure after one increment, capped at the target
    #[inline]
    #[must_use]
    pub fn next_percentage(&self, step: u8) -> u8 {
        self.current_percentage
            .saturating_add(step)
            .min(self.target_percentage)
    }

    /// Raise exposure
    ///
    /// # Errors
    /// `InvalidTransition`-style config error if `to` would decrease exposure.
    pub fn advance_to(&mut self, to: u8, now: DateTime<Utc>) -> Result<(), DrxError> {
        if to < self.current_percentage || to > 100 {
            return Err(DrxError::Config(format!(
                "rollout for {} cannot move from {}% to {}%",
                self.component_name, self.current_percentage, to
            )));
        }
        self.current_percentage = to;
        self.last_step_at = now;
        self.consecutive_healthy_checks = 0;
        if self.current_percentage >= self.target_percentage {
            self.status = RolloutStatus::Completed;
        }
        Ok(())
    }

    /// Full revert in one step
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.current_percentage = 0;
        self.consecutive_healthy_checks = 0;
        self.last_step_at = now;
        self.status = RolloutStatus::Reverted;
        self.revert_count = self.revert_count.saturating_add(1);
    }

    /// Traffic split matching the current exposure
    #[must_use]
    pub fn split(&self) -> TrafficSplit {
        let mut split = TrafficSplit::new();
        split.insert(self.stable_env.clone(), 100 - self.current_percentage);
        if self.current_percentage > 0 {
            split.insert(self.candidate_env.clone(), self.current_percentage);
        }
        split
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == RolloutStatus::Progressing
    }
}

/// Deployment environment identifier issued by the control plane
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvId(pub String);

impl EnvId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Percentage of a component's traffic per environment
pub type TrafficSplit = BTreeMap<EnvId, u8>;

/// Why an environment is being provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvPurpose {
    Recovery,
    Failover,
    Canary,
}

/// Request to provision an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub name: String,
    pub region: String,
    pub components: Vec<String>,
    pub purpose: EnvPurpose,
}

/// Aggregate health of an environment
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthReading {
    /// Fraction of failed requests, 0.0-1.0
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    /// Relative provider-performance regression, if reported
    pub provider_delta: Option<f64>,
}

impl HealthReading {
    #[must_use]
    pub fn new(error_rate: f64, p95_latency_ms: f64) -> Self {
        Self {
            error_rate,
            p95_latency_ms,
            provider_delta: None,
        }
    }

    #[must_use]
    pub fn with_provider_delta(mut self, delta: f64) -> Self {
        self.provider_delta = Some(delta);
        self
    }
}

/// Target of a dump or restore
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DumpTarget {
    pub component: String,
    /// `None` means the primary deployment
    pub environment: Option<EnvId>,
}

impl DumpTarget {
    #[must_use]
    pub fn primary(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            environment: None,
        }
    }

    #[must_use]
    pub fn in_env(component: impl Into<String>, env: EnvId) -> Self {
        Self {
            component: component.into(),
            environment: Some(env),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn backup_key_is_tier_prefixed() {
        let key = backup_key(Tier::Hot, "database", t0());
        assert!(key.starts_with("hot/database/"));
        assert_eq!(key, "hot/database/20260301T120000.000Z");
    }

    #[test]
    fn job_lifecycle() {
        let mut job = BackupJob::new(Tier::Warm, "config", t0());
        assert!(job.is_in_flight());
        job.mark_running();
        assert!(job.is_in_flight());
        job.mark_uploaded("warm/config/x".into(), Checksum::compute(b"x"), 1);
        assert!(!job.is_in_flight());
        assert!(!job.is_terminal());
        job.validated = true;
        assert!(job.is_terminal());
    }

    #[test]
    fn component_ref_parse() {
        let r: ComponentRef = "agent-coordinator@1.4.2".parse().unwrap();
        assert_eq!(r.name, "agent-coordinator");
        assert_eq!(r.version, "1.4.2");
        assert_eq!(r.to_string(), "agent-coordinator@1.4.2");
        assert!("nover@".parse::<ComponentRef>().is_err());
        assert!("plain".parse::<ComponentRef>().is_err());
    }

    #[test]
    fn dr_level_serializes_as_number() {
        assert_eq!(serde_json::to_string(&DrLevel::RegionalLoss).unwrap(), "3");
        let level: DrLevel = serde_json::from_str("2").unwrap();
        assert_eq!(level, DrLevel::ServiceOutage);
        assert!(serde_json::from_str::<DrLevel>("5").is_err());
    }

    #[test]
    fn incident_levels_only_increase() {
        let trigger = IncidentTrigger::new(
            vec!["api".into()],
            "latency",
            TriggerSource::Monitoring,
            DrLevel::RegionalLoss,
        );
        let mut incident = DrIncident::open(trigger, t0());

        assert!(incident
            .escalate_to(DrLevel::ServiceOutage, "noise", t0())
            .is_err());
        assert!(incident
            .escalate_to(DrLevel::RegionalLoss, "same", t0())
            .is_err());
        incident
            .escalate_to(DrLevel::Catastrophic, "failover failed", t0())
            .unwrap();

        assert_eq!(incident.status, IncidentStatus::Escalated);
        assert!(incident.automation_frozen);
        assert!(incident.is_open());

        incident.resolve("oncall", t0());
        assert!(!incident.is_open());
        assert!(incident
            .escalate_to(DrLevel::Catastrophic, "late", t0())
            .is_err());
    }

    #[test]
    fn incident_record_json_shape() {
        let trigger =
            IncidentTrigger::new(vec![], "manual", TriggerSource::Operator, DrLevel::ServiceOutage);
        let incident = DrIncident::open(trigger, t0());
        let json = serde_json::to_value(&incident).unwrap();

        for field in ["id", "level", "trigger", "openedAt", "resolvedAt", "status"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(json["status"], "active");
        assert_eq!(json["level"], 2);
    }

    #[test]
    fn rollout_advance_and_reset() {
        let mut state = RolloutState::new("api", EnvId::new("green"), EnvId::new("blue"), 30, t0());
        state.advance_to(state.next_percentage(10), t0()).unwrap();
        assert_eq!(state.current_percentage, 10);
        assert!(state.advance_to(5, t0()).is_err());

        state.advance_to(state.next_percentage(25), t0()).unwrap();
        assert_eq!(state.current_percentage, 30);
        assert_eq!(state.status, RolloutStatus::Completed);

        state.reset(t0());
        assert_eq!(state.current_percentage, 0);
        assert_eq!(state.revert_count, 1);
        assert_eq!(state.split().get(&EnvId::new("blue")), Some(&100));
        assert!(state.split().get(&EnvId::new("green")).is_none());
    }
}
