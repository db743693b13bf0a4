//! Alerting
//!
//! Every terminal failure in DRX raises an alert through an [`Alerter`].
//! The default sink, [`TracingAlerter`], emits structured `tracing` events;
//! deployments plug in a pager or chat integration instead.

use crate::types::IncidentId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Alert severity, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational, no action needed
    Info,
    /// Degraded but self-healing
    Warning,
    /// Needs attention soon
    Critical,
    /// Highest severity: page a human now
    Page,
}

/// What kind of failure raised the alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    TransientIo,
    Validation,
    BackupMissing,
    DependencyOrder,
    SafetySnapshot,
    Timeout,
    Concurrency,
    RetriesExhausted,
    RollbackFailed,
    RolloutReverted,
    Escalation,
    ManualIntervention,
    Recovered,
    Internal,
}

impl AlertCategory {
    /// Stable label for logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::TransientIo => "transient_io",
            AlertCategory::Validation => "validation_error",
            AlertCategory::BackupMissing => "backup_missing",
            AlertCategory::DependencyOrder => "dependency_order",
            AlertCategory::SafetySnapshot => "safety_snapshot",
            AlertCategory::Timeout => "timeout",
            AlertCategory::Concurrency => "concurrency_violation",
            AlertCategory::RetriesExhausted => "retries_exhausted",
            AlertCategory::RollbackFailed => "rollback_failed",
            AlertCategory::RolloutReverted => "rollout_reverted",
            AlertCategory::Escalation => "escalation",
            AlertCategory::ManualIntervention => "manual_intervention",
            AlertCategory::Recovered => "recovered",
            AlertCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured context attached to an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertContext {
    pub category: AlertCategory,
    pub component: Option<String>,
    pub incident: Option<IncidentId>,
    pub fields: BTreeMap<String, String>,
}

impl AlertContext {
    #[inline]
    #[must_use]
    pub fn new(category: AlertCategory) -> Self {
        Self {
            category,
            component: None,
            incident: None,
            fields: BTreeMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_incident(mut self, incident: IncidentId) -> Self {
        self.incident = Some(incident);
        self
    }

    /// Add a key/value pair
    #[inline]
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }
}

/// An alert as delivered to a sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub context: AlertContext,
    pub raised_at: DateTime<Utc>,
}

/// Alert sink
///
/// Delivery is fire-and-forget from the caller's point of view; a sink that
/// cannot deliver must log the failure itself.
#[async_trait]
pub trait Alerter: Send + Sync {
    /// Deliver one alert
    async fn send_alert(&self, severity: AlertSeverity, message: &str, context: AlertContext);
}

/// Alerter that writes alerts to the tracing pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerter;

#[async_trait]
impl Alerter for TracingAlerter {
    async fn send_alert(&self, severity: AlertSeverity, message: &str, context: AlertContext) {
        let component = context.component.as_deref().unwrap_or("-");
        let incident = context
            .incident
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".to_string());
        match severity {
            AlertSeverity::Info => tracing::info!(
                category = %context.category,
                component,
                incident = %incident,
                fields = ?context.fields,
                "{message}"
            ),
            AlertSeverity::Warning => tracing::warn!(
                category = %context.category,
                component,
                incident = %incident,
                fields = ?context.fields,
                "{message}"
            ),
            AlertSeverity::Critical | AlertSeverity::Page => tracing::error!(
                severity = ?severity,
                category = %context.category,
                component,
                incident = %incident,
                fields = ?context.fields,
                "{message}"
            ),
        }
    }
}
