//! Gradual traffic shifting
//!
//! A rollout moves a component's candidate environment from 0% to its target
//! exposure in fixed increments. Each increment needs a run of consecutive
//! healthy polls; a single unhealthy poll sends all traffic back to the stable
//! environment in one step. State lives in the [`RolloutStore`] and every
//! write is a compare-and-swap, so only one controller instance can move a
//! given rollout.

use chrono::Utc;
use drx_core::store::RolloutStore;
use drx_core::telemetry::ROLLOUT_REVERTS_TOTAL;
use drx_core::{
    with_timeout, AlertCategory, AlertContext, AlertSeverity, Alerter, Collaborators,
    DeploymentControlPlane, DrLevel, DrxError, EnvId, IncidentTrigger, RolloutConfig,
    RolloutState, RolloutStatus, TrafficSplit, TriggerSource,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of one health poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Healthy, not enough consecutive polls yet
    Healthy { consecutive: u32 },
    /// Exposure raised
    Advanced { to: u8 },
    /// Target exposure reached
    Completed,
    /// Unhealthy reading; all traffic back on stable
    Reverted { reason: String },
    /// Rollout is not progressing
    Idle { status: RolloutStatus },
}

pub struct TrafficShiftController {
    config: RolloutConfig,
    rollouts: Arc<dyn RolloutStore>,
    control: Arc<dyn DeploymentControlPlane>,
    alerter: Arc<dyn Alerter>,
    triggers: Option<mpsc::Sender<IncidentTrigger>>,
}

impl TrafficShiftController {
    pub fn new(config: RolloutConfig, rollouts: Arc<dyn RolloutStore>, ports: &Collaborators) -> Self {
        Self {
            config,
            rollouts,
            control: ports.control.clone(),
            alerter: ports.alerter.clone(),
            triggers: None,
        }
    }

    /// Send a Level-1 trigger here once a component keeps reverting
    #[must_use]
    pub fn with_trigger_sink(mut self, sink: mpsc::Sender<IncidentTrigger>) -> Self {
        self.triggers = Some(sink);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Current state of a component's rollout
    pub async fn status(&self, component: &str) -> Result<Option<RolloutState>, DrxError> {
        self.rollouts.get(component).await
    }

    /// Register a rollout at 0% and route everything to `stable_env`
    ///
    /// # Errors
    /// `ConcurrencyViolation` if the component already has a progressing
    /// rollout, or the control-plane error if the split cannot be applied.
    #[instrument(skip(self), fields(candidate = %candidate_env, stable = %stable_env))]
    pub async fn start(
        &self,
        component: &str,
        candidate_env: EnvId,
        stable_env: EnvId,
        target_percentage: u8,
    ) -> Result<RolloutState, DrxError> {
        let state = self
            .rollouts
            .begin(RolloutState::new(
                component,
                candidate_env,
                stable_env,
                target_percentage,
                Utc::now(),
            ))
            .await?;
        self.apply_split(component, &state.split()).await?;
        info!(target = state.target_percentage, "rollout started");
        Ok(state)
    }

    /// Poll candidate health once and move the rollout accordingly
    ///
    /// A failed or timed-out health check counts as unhealthy.
    ///
    /// # Errors
    /// `NotFound` for unknown rollouts, `StaleRevision` if another writer
    /// moved the rollout concurrently, or the control-plane error when a
    /// split cannot be applied.
    #[instrument(skip(self))]
    pub async fn poll_once(&self, component: &str) -> Result<PollOutcome, DrxError> {
        let mut state = self
            .rollouts
            .get(component)
            .await?
            .ok_or_else(|| DrxError::NotFound(format!("rollout {component}")))?;
        if !state.is_active() {
            return Ok(PollOutcome::Idle {
                status: state.status,
            });
        }

        let reading = with_timeout(
            "health_check",
            self.config.operation_timeout(),
            self.control.health_check(&state.candidate_env),
        )
        .await;
        let problem = match reading {
            Ok(reading) => self.config.thresholds.violation(&reading),
            Err(err) => Some(err.to_string()),
        };

        if let Some(reason) = problem {
            return self.revert(state, reason).await;
        }

        let expected = state.revision;
        state.consecutive_healthy_checks += 1;
        if state.consecutive_healthy_checks < self.config.required_healthy_polls {
            let consecutive = state.consecutive_healthy_checks;
            self.rollouts.compare_and_swap(expected, state).await?;
            debug!(consecutive, "healthy poll");
            return Ok(PollOutcome::Healthy { consecutive });
        }

        // Traffic moves before the store does: a stored percentage is always
        // one the control plane accepted.
        let to = state.next_percentage(self.config.step_percent);
        state.advance_to(to, Utc::now())?;
        if let Err(err) = self.apply_split(component, &state.split()).await {
            error!(error = %err, percentage = to, "advance split could not be applied");
            self.alerter
                .send_alert(
                    AlertSeverity::Warning,
                    &format!("{component}: traffic split to {to}% failed: {err}"),
                    AlertContext::new(err.alert_category())
                        .with_component(component.to_string())
                        .with("percentage", to),
                )
                .await;
            return Err(err);
        }
        let state = match self.rollouts.compare_and_swap(expected, state).await {
            Ok(state) => state,
            Err(err) => {
                self.resync_split(component).await;
                return Err(err);
            }
        };
        info!(percentage = to, "rollout advanced");

        if state.status == RolloutStatus::Completed {
            info!("rollout completed");
            Ok(PollOutcome::Completed)
        } else {
            Ok(PollOutcome::Advanced { to })
        }
    }

    /// Re-apply the stored split after losing a write to another controller
    async fn resync_split(&self, component: &str) {
        let stored = match self.rollouts.get(component).await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(err) => {
                error!(error = %err, "cannot reload rollout to resync traffic");
                return;
            }
        };
        if let Err(err) = self.apply_split(component, &stored.split()).await {
            error!(error = %err, "traffic split left ahead of stored rollout");
        }
    }

    async fn revert(&self, mut state: RolloutState, reason: String) -> Result<PollOutcome, DrxError> {
        let component = state.component_name.clone();
        let from = state.current_percentage;
        let expected = state.revision;
        state.reset(Utc::now());
        let state = self.rollouts.compare_and_swap(expected, state).await?;

        if let Err(err) = self.apply_split(&component, &state.split()).await {
            error!(error = %err, "revert split could not be applied");
            self.alerter
                .send_alert(
                    AlertSeverity::Critical,
                    &format!("{component}: revert to stable failed: {err}"),
                    AlertContext::new(err.alert_category()).with_component(component.clone()),
                )
                .await;
            return Err(err);
        }

        warn!(from, reason = %reason, reverts = state.revert_count, "rollout reverted");
        metrics::counter!(ROLLOUT_REVERTS_TOTAL, "component" => component.clone()).increment(1);
        self.alerter
            .send_alert(
                AlertSeverity::Warning,
                &format!("{component} rollout reverted from {from}%: {reason}"),
                AlertContext::new(AlertCategory::RolloutReverted)
                    .with_component(component.clone())
                    .with("from_percentage", from)
                    .with("reverts", state.revert_count),
            )
            .await;

        let threshold = self.config.revert_escalation_threshold;
        if threshold > 0 && state.revert_count >= threshold {
            self.raise_trigger(&component, state.revert_count).await;
        }
        Ok(PollOutcome::Reverted { reason })
    }

    async fn raise_trigger(&self, component: &str, reverts: u32) {
        let Some(sink) = &self.triggers else {
            return;
        };
        let trigger = IncidentTrigger::new(
            vec![component.to_string()],
            format!("{component} reverted {reverts} rollouts"),
            TriggerSource::RolloutReverts,
            DrLevel::ServiceDegradation,
        );
        if sink.send(trigger).await.is_err() {
            warn!(component, "incident trigger sink closed");
        }
    }

    /// Stop the rollout where it is, keeping the last applied split
    ///
    /// # Errors
    /// `NotFound` for unknown rollouts; `StaleRevision` on a concurrent write.
    pub async fn cancel(&self, component: &str) -> Result<RolloutState, DrxError> {
        let mut state = self
            .rollouts
            .get(component)
            .await?
            .ok_or_else(|| DrxError::NotFound(format!("rollout {component}")))?;
        if !state.is_active() {
            return Ok(state);
        }
        let expected = state.revision;
        state.status = RolloutStatus::Cancelled;
        let state = self.rollouts.compare_and_swap(expected, state).await?;
        info!(component, percentage = state.current_percentage, "rollout cancelled");
        Ok(state)
    }

    /// Drive a rollout until it completes, reverts or is cancelled
    ///
    /// Waits the poll interval between polls and the dwell interval after
    /// each increment.
    ///
    /// # Errors
    /// Whatever stopped the loop other than cancellation.
    #[instrument(skip(self, cancel))]
    pub async fn run(
        &self,
        component: &str,
        cancel: CancellationToken,
    ) -> Result<RolloutState, DrxError> {
        loop {
            if cancel.is_cancelled() {
                return self.cancel(component).await;
            }
            let wait = match self.poll_once(component).await? {
                PollOutcome::Healthy { .. } => self.config.poll_interval(),
                PollOutcome::Advanced { .. } => self.config.dwell(),
                PollOutcome::Completed
                | PollOutcome::Reverted { .. }
                | PollOutcome::Idle { .. } => break,
            };
            tokio::select! {
                () = cancel.cancelled() => return self.cancel(component).await,
                () = tokio::time::sleep(wait) => {}
            }
        }
        self.rollouts
            .get(component)
            .await?
            .ok_or_else(|| DrxError::NotFound(format!("rollout {component}")))
    }

    /// Route every listed component entirely to `target`
    ///
    /// # Errors
    /// The first control-plane failure; earlier components stay switched.
    pub async fn failover(&self, components: &[String], target: &EnvId) -> Result<(), DrxError> {
        let split = TrafficSplit::from([(target.clone(), 100)]);
        for component in components {
            self.apply_split(component, &split).await?;
        }
        info!(target = %target, count = components.len(), "traffic failed over");
        Ok(())
    }

    /// Send `percent` of a component's traffic to `minority`, the rest to `majority`
    ///
    /// # Errors
    /// `Config` unless `percent` is a minority share, or the control-plane
    /// failure.
    pub async fn route_minority(
        &self,
        component: &str,
        majority: &EnvId,
        minority: &EnvId,
        percent: u8,
    ) -> Result<(), DrxError> {
        if percent == 0 || percent >= 50 {
            return Err(DrxError::Config(format!(
                "{percent}% is not a minority share"
            )));
        }
        let split = TrafficSplit::from([(majority.clone(), 100 - percent), (minority.clone(), percent)]);
        self.apply_split(component, &split).await
    }

    async fn apply_split(&self, component: &str, split: &TrafficSplit) -> Result<(), DrxError> {
        with_timeout(
            "set_traffic_split",
            self.config.operation_timeout(),
            self.control.set_traffic_split(component, split),
        )
        .await
    }
}
