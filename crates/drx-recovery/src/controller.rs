//! DR escalation controller
//!
//! Incidents move through four levels, never downward:
//!
//! | level | procedure |
//! |---|---|
//! | L1 service degradation | restart in place, re-check health |
//! | L2 service outage | parallel environment from validated backups, minority traffic |
//! | L3 regional loss | geo backups into the secondary region, full failover |
//! | L4 catastrophic | freeze automation, page a human |
//!
//! The incident record in the [`IncidentTable`] is the state. Every change is
//! a compare-and-swap on its revision, so a controller restarted mid-incident
//! picks up at the stored level and a transition is applied at most once.

use crate::procedures::StepOutcome;
use chrono::Utc;
use dashmap::DashMap;
use drx_core::store::{IncidentTable, ManifestIndex, Stores, VersionRegistry};
use drx_core::telemetry::INCIDENT_TRANSITIONS_TOTAL;
use drx_core::{
    AlertCategory, AlertContext, AlertSeverity, Collaborators, ComponentRef, DrConfig, DrIncident,
    DrLevel, DrxError, IncidentId, IncidentStatus, IncidentTrigger, TriggerSource,
};
use drx_rollback::{RollbackManager, RollbackReport};
use drx_traffic::TrafficShiftController;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const CAS_ATTEMPTS: u32 = 5;

/// Drives DR incidents from trigger to resolution
pub struct DrController {
    pub(crate) config: DrConfig,
    pub(crate) incidents: Arc<dyn IncidentTable>,
    pub(crate) manifests: Arc<dyn ManifestIndex>,
    pub(crate) versions: Arc<dyn VersionRegistry>,
    pub(crate) ports: Collaborators,
    pub(crate) traffic: Arc<TrafficShiftController>,
    rollback: Option<Arc<RollbackManager>>,
    in_flight: DashMap<IncidentId, CancellationToken>,
}

impl DrController {
    pub fn new(
        config: DrConfig,
        stores: &Stores,
        ports: Collaborators,
        traffic: Arc<TrafficShiftController>,
    ) -> Self {
        Self {
            config,
            incidents: stores.incidents.clone(),
            manifests: stores.manifests.clone(),
            versions: stores.versions.clone(),
            ports,
            traffic,
            rollback: None,
            in_flight: DashMap::new(),
        }
    }

    /// Enable operator-initiated rollbacks under an incident
    #[must_use]
    pub fn with_rollback_manager(mut self, manager: Arc<RollbackManager>) -> Self {
        self.rollback = Some(manager);
        self
    }

    #[must_use]
    pub fn config(&self) -> &DrConfig {
        &self.config
    }

    pub async fn incident(&self, id: IncidentId) -> Result<Option<DrIncident>, DrxError> {
        self.incidents.get(id).await
    }

    pub async fn active(&self) -> Result<Option<DrIncident>, DrxError> {
        self.incidents.active().await
    }

    pub async fn history(&self) -> Result<Vec<DrIncident>, DrxError> {
        self.incidents.history().await
    }

    /// Open an incident for `trigger`, or fold it into the active one
    ///
    /// A trigger for a higher level escalates the active incident unless
    /// automation is frozen; anything else is kept as evidence.
    ///
    /// # Errors
    /// Incident table failures.
    #[instrument(skip(self, trigger), fields(level = %trigger.level, source = ?trigger.source))]
    pub async fn handle_trigger(&self, trigger: IncidentTrigger) -> Result<DrIncident, DrxError> {
        if let Some(active) = self.incidents.active().await? {
            return self.absorb(active.id, trigger).await;
        }

        match self
            .incidents
            .open(DrIncident::open(trigger.clone(), Utc::now()))
            .await
        {
            Ok(incident) => {
                info!(incident = %incident.id, components = ?incident.trigger.components, "incident opened");
                metrics::counter!(INCIDENT_TRANSITIONS_TOTAL, "level" => incident.level.to_string())
                    .increment(1);
                let severity = if incident.level == DrLevel::ServiceDegradation {
                    AlertSeverity::Warning
                } else {
                    AlertSeverity::Critical
                };
                self.ports
                    .alerter
                    .send_alert(
                        severity,
                        &format!(
                            "DR incident opened at {}: {}",
                            incident.level, incident.trigger.reason
                        ),
                        AlertContext::new(AlertCategory::Escalation)
                            .with_incident(incident.id)
                            .with("components", incident.trigger.components.join(",")),
                    )
                    .await;
                if incident.level == DrLevel::Catastrophic {
                    return self.freeze(incident.id).await;
                }
                Ok(incident)
            }
            // Lost the race for the singleton slot.
            Err(DrxError::ConcurrencyViolation(_)) => {
                let active = self.incidents.active().await?.ok_or_else(|| {
                    DrxError::ConcurrencyViolation("incident slot contended".to_string())
                })?;
                self.absorb(active.id, trigger).await
            }
            Err(err) => Err(err),
        }
    }

    /// Operator-declared incident at any level
    ///
    /// # Errors
    /// As [`Self::handle_trigger`].
    pub async fn declare(
        &self,
        components: Vec<String>,
        reason: impl Into<String>,
        level: DrLevel,
    ) -> Result<DrIncident, DrxError> {
        self.handle_trigger(IncidentTrigger::new(
            components,
            reason,
            TriggerSource::Operator,
            level,
        ))
        .await
    }

    async fn absorb(&self, id: IncidentId, trigger: IncidentTrigger) -> Result<DrIncident, DrxError> {
        let before = self.load(id).await?.level;
        let now = Utc::now();
        let incident = self
            .update(id, |incident| {
                if !incident.is_open() {
                    return Ok(false);
                }
                incident.evidence.push(trigger.clone());
                if !incident.automation_frozen && trigger.level > incident.level {
                    incident.escalate_to(trigger.level, trigger.reason.clone(), now)?;
                }
                Ok(true)
            })
            .await?;
        if incident.level > before {
            self.on_escalated(&incident, before).await;
        } else {
            info!(incident = %id, "trigger recorded as evidence");
        }
        Ok(incident)
    }

    /// Run procedures for the incident's current level until it resolves,
    /// reaches level 4, or is cancelled
    ///
    /// Safe to call again for the same incident: resolved and frozen
    /// incidents are returned untouched.
    ///
    /// # Errors
    /// Incident table failures. Procedure failures escalate instead.
    #[instrument(skip(self))]
    pub async fn drive(&self, id: IncidentId) -> Result<DrIncident, DrxError> {
        let token = self
            .in_flight
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone();
        let result = self.drive_levels(id, &token).await;
        self.in_flight.remove(&id);
        result
    }

    async fn drive_levels(
        &self,
        id: IncidentId,
        token: &CancellationToken,
    ) -> Result<DrIncident, DrxError> {
        loop {
            let incident = self.load(id).await?;
            if !incident.is_open() || incident.automation_frozen || token.is_cancelled() {
                return Ok(incident);
            }

            let level = incident.level;
            info!(level = %level, "running recovery procedure");
            let outcome = match level {
                DrLevel::ServiceDegradation => self.restart_in_place(&incident, token).await,
                DrLevel::ServiceOutage => self.recover_in_parallel(&incident, token).await,
                DrLevel::RegionalLoss => self.fail_over_region(&incident, token).await,
                DrLevel::Catastrophic => return self.freeze(id).await,
            };

            match outcome {
                StepOutcome::Recovered(annotation) => {
                    return self.finish(id, level, annotation).await;
                }
                StepOutcome::Failed(reason) => {
                    warn!(level = %level, reason = %reason, "recovery procedure failed");
                    self.escalate_from(id, level, reason).await?;
                }
                StepOutcome::Cancelled => {
                    info!(level = %level, "recovery procedure cancelled");
                    return self.load(id).await;
                }
            }
        }
    }

    /// Close an incident; stops any in-flight procedure and unfreezes
    /// automation
    ///
    /// # Errors
    /// `NotFound` for unknown incidents, incident table failures.
    pub async fn resolve(&self, id: IncidentId, by: &str) -> Result<DrIncident, DrxError> {
        self.close(id, by, None).await
    }

    /// Stop automation for an incident and close it, leaving the system in
    /// its last known-good state
    ///
    /// # Errors
    /// As [`Self::resolve`].
    pub async fn cancel(&self, id: IncidentId, by: &str) -> Result<DrIncident, DrxError> {
        self.close(id, by, Some(format!("automation cancelled by {by}")))
            .await
    }

    async fn close(
        &self,
        id: IncidentId,
        by: &str,
        annotation: Option<String>,
    ) -> Result<DrIncident, DrxError> {
        if let Some(token) = self.in_flight.get(&id) {
            token.cancel();
        }
        let now = Utc::now();
        let mut closed_here = false;
        let incident = self
            .update(id, |incident| {
                closed_here = incident.is_open();
                if !closed_here {
                    return Ok(false);
                }
                if let Some(note) = &annotation {
                    incident.annotations.push(note.clone());
                }
                incident.resolve(by, now);
                Ok(true)
            })
            .await?;
        if !closed_here {
            debug!(incident = %id, by, "incident already closed");
            return Ok(incident);
        }
        info!(incident = %id, by, "incident resolved");
        self.ports
            .alerter
            .send_alert(
                AlertSeverity::Info,
                &format!("DR incident resolved at {} by {by}", incident.level),
                AlertContext::new(AlertCategory::Recovered).with_incident(id),
            )
            .await;
        Ok(incident)
    }

    /// Roll components back under an open incident
    ///
    /// A failed rollback escalates the incident one level.
    ///
    /// # Errors
    /// `Config` without a rollback manager, `AutomationFrozen` at level 4,
    /// `InvalidTransition` for a closed incident, otherwise as
    /// [`RollbackManager::rollback_set`].
    pub async fn rollback(
        &self,
        id: IncidentId,
        targets: &[ComponentRef],
    ) -> Result<RollbackReport, DrxError> {
        let manager = self
            .rollback
            .as_ref()
            .ok_or_else(|| DrxError::Config("no rollback manager configured".to_string()))?;
        let incident = self.load(id).await?;
        if incident.automation_frozen {
            return Err(DrxError::AutomationFrozen { incident: id });
        }
        if !incident.is_open() {
            return Err(DrxError::InvalidTransition {
                from: incident.level,
                to: incident.level,
            });
        }

        let report = manager.rollback_set(targets).await?;
        let note = match report.failed() {
            None => format!("rolled back {}", report.order().join(", ")),
            Some(failed) => format!("rollback stopped at {}", failed.component),
        };
        let incident = self
            .update(id, |incident| {
                incident.annotations.push(note.clone());
                Ok(true)
            })
            .await?;
        // A failed rollback counts as a failed procedure at the current level.
        if !report.is_success() {
            self.escalate_from(id, incident.level, note).await?;
        }
        Ok(report)
    }

    /// Consume triggers until `cancel` fires or every sender is gone
    ///
    /// Each trigger that leaves an incident open and unfrozen drives it.
    pub async fn run(&self, mut triggers: mpsc::Receiver<IncidentTrigger>, cancel: CancellationToken) {
        loop {
            let trigger = tokio::select! {
                () = cancel.cancelled() => break,
                next = triggers.recv() => match next {
                    Some(trigger) => trigger,
                    None => break,
                },
            };
            let incident = match self.handle_trigger(trigger).await {
                Ok(incident) => incident,
                Err(err) => {
                    error!(error = %err, "trigger could not be recorded");
                    continue;
                }
            };
            if !incident.is_open() || incident.automation_frozen {
                continue;
            }

            let drive = self.drive(incident.id);
            tokio::pin!(drive);
            let result = tokio::select! {
                result = &mut drive => result,
                () = cancel.cancelled() => {
                    for token in self.in_flight.iter() {
                        token.cancel();
                    }
                    drive.await
                }
            };
            if let Err(err) = result {
                error!(incident = %incident.id, error = %err, "incident could not be driven");
            }
        }
        info!("DR controller stopped");
    }

    // -----------------------------------------------------------------------

    pub(crate) async fn load(&self, id: IncidentId) -> Result<DrIncident, DrxError> {
        self.incidents
            .get(id)
            .await?
            .ok_or_else(|| DrxError::NotFound(format!("incident {id}")))
    }

    /// Read-modify-CAS with retry on stale revisions
    ///
    /// `apply` returns `false` to leave the stored record alone.
    async fn update<F>(&self, id: IncidentId, mut apply: F) -> Result<DrIncident, DrxError>
    where
        F: FnMut(&mut DrIncident) -> Result<bool, DrxError>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.load(id).await?;
            let mut next = current.clone();
            if !apply(&mut next)? {
                return Ok(current);
            }
            match self.incidents.compare_and_swap(current.revision, next).await {
                Ok(stored) => return Ok(stored),
                Err(DrxError::StaleRevision { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DrxError::ConcurrencyViolation(format!(
            "incident {id} kept changing under update"
        )))
    }

    async fn finish(
        &self,
        id: IncidentId,
        level: DrLevel,
        annotation: String,
    ) -> Result<DrIncident, DrxError> {
        let now = Utc::now();
        let incident = self
            .update(id, |incident| {
                if !incident.is_open() || incident.level != level {
                    return Ok(false);
                }
                incident.annotations.push(annotation.clone());
                incident.resolve("automation", now);
                Ok(true)
            })
            .await?;
        if incident.status == IncidentStatus::Resolved {
            info!(incident = %id, level = %level, annotation = %annotation, "incident recovered");
            self.ports
                .alerter
                .send_alert(
                    AlertSeverity::Info,
                    &format!("DR incident recovered at {level}: {annotation}"),
                    AlertContext::new(AlertCategory::Recovered).with_incident(id),
                )
                .await;
        }
        Ok(incident)
    }

    async fn escalate_from(
        &self,
        id: IncidentId,
        from: DrLevel,
        reason: String,
    ) -> Result<DrIncident, DrxError> {
        let Some(to) = from.next() else {
            return self.freeze(id).await;
        };
        let now = Utc::now();
        let incident = self
            .update(id, |incident| {
                // Another writer already moved it on.
                if !incident.is_open() || incident.level != from {
                    return Ok(false);
                }
                incident.escalate_to(to, reason.clone(), now)?;
                Ok(true)
            })
            .await?;
        if incident.level == to {
            self.on_escalated(&incident, from).await;
        }
        Ok(incident)
    }

    async fn on_escalated(&self, incident: &DrIncident, from: DrLevel) {
        let reason = incident
            .level_history
            .last()
            .map(|change| change.reason.as_str())
            .unwrap_or_default();
        warn!(incident = %incident.id, from = %from, to = %incident.level, reason, "incident escalated");
        metrics::counter!(INCIDENT_TRANSITIONS_TOTAL, "level" => incident.level.to_string())
            .increment(1);

        if incident.level == DrLevel::Catastrophic {
            self.page_operators(incident).await;
        } else {
            self.ports
                .alerter
                .send_alert(
                    AlertSeverity::Critical,
                    &format!("DR incident escalated {from} -> {}: {reason}", incident.level),
                    AlertContext::new(AlertCategory::Escalation)
                        .with_incident(incident.id)
                        .with("from", from)
                        .with("to", incident.level),
                )
                .await;
        }
    }

    /// Put an incident into the level-4 frozen state
    async fn freeze(&self, id: IncidentId) -> Result<DrIncident, DrxError> {
        let mut paged = false;
        let incident = self
            .update(id, |incident| {
                if !incident.is_open() || incident.automation_frozen {
                    return Ok(false);
                }
                incident.status = IncidentStatus::Escalated;
                incident.automation_frozen = true;
                paged = true;
                Ok(true)
            })
            .await?;
        if paged {
            self.page_operators(&incident).await;
        }
        Ok(incident)
    }

    async fn page_operators(&self, incident: &DrIncident) {
        error!(incident = %incident.id, "automation frozen, manual intervention required");
        let message = format!(
            "DR incident {} is catastrophic; automation is frozen. \
             Confirm the extent of the outage, pick a recovery region, restore from the newest \
             validated geo backups, then resolve the incident to resume automation. \
             Components: {}",
            incident.id,
            incident.trigger.components.join(", ")
        );
        self.ports
            .alerter
            .send_alert(
                AlertSeverity::Page,
                &message,
                AlertContext::new(AlertCategory::ManualIntervention).with_incident(incident.id),
            )
            .await;
    }
}
