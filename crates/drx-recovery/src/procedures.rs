//! Level procedures
//!
//! Each procedure reports how it ended; the controller turns that into a
//! resolution or an escalation. Operator cancellation is checked between
//! external calls. An environment that never received traffic is deleted on
//! the way out.

use crate::controller::DrController;
use drx_core::{
    with_timeout, Checksum, ComponentKind, DrIncident, DrxError, DumpTarget, EnvId, EnvPurpose,
    EnvironmentSpec, Tier,
};
use drx_rollback::DependencyGraph;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// Healthy again; the string annotates the resolved incident
    Recovered(String),
    Failed(String),
    Cancelled,
}

impl DrController {
    /// Level 1: restart in place and re-check health
    pub(crate) async fn restart_in_place(
        &self,
        incident: &DrIncident,
        token: &CancellationToken,
    ) -> StepOutcome {
        let env = &self.config.primary_env;
        let limit = self.config.operation_timeout();
        for component in &incident.trigger.components {
            if let Err(err) = with_timeout(
                "restart_component",
                limit,
                self.ports.control.restart_component(env, component),
            )
            .await
            {
                return StepOutcome::Failed(format!("restart of {component} failed: {err}"));
            }
            info!(component, "component restarted");
        }

        let attempts = self.config.level1_health_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    () = token.cancelled() => return StepOutcome::Cancelled,
                    () = tokio::time::sleep(self.config.health_poll_interval()) => {}
                }
            }
            match self.check_health(env).await {
                Ok(()) => {
                    return StepOutcome::Recovered(format!(
                        "restarted {} in place",
                        incident.trigger.components.join(", ")
                    ))
                }
                Err(reason) => warn!(attempt, reason = %reason, "health check failed after restart"),
            }
        }
        StepOutcome::Failed(format!(
            "still unhealthy after {attempts} health checks following restart"
        ))
    }

    /// Level 2: parallel environment from the latest validated backups,
    /// taking a minority of traffic
    pub(crate) async fn recover_in_parallel(
        &self,
        incident: &DrIncident,
        token: &CancellationToken,
    ) -> StepOutcome {
        let components = &incident.trigger.components;
        let spec = EnvironmentSpec {
            name: format!("recovery-{}", incident.id),
            region: self.config.primary_region.clone(),
            components: components.clone(),
            purpose: EnvPurpose::Recovery,
        };
        let env = match self.provision(&spec).await {
            Ok(env) => env,
            Err(err) => return StepOutcome::Failed(format!("recovery environment: {err}")),
        };
        info!(env = %env, "recovery environment provisioned");

        if let Err(reason) = self.populate(&env, components, None).await {
            self.discard(&env).await;
            return StepOutcome::Failed(reason);
        }
        if token.is_cancelled() {
            self.discard(&env).await;
            return StepOutcome::Cancelled;
        }

        let primary = &self.config.primary_env;
        let share = self.config.recovery_traffic_percent;
        let mut routed = Vec::new();
        for component in components {
            if let Err(err) = self
                .traffic
                .route_minority(component, primary, &env, share)
                .await
            {
                self.route_back(&routed).await;
                self.discard(&env).await;
                return StepOutcome::Failed(format!("routing {component} to {env}: {err}"));
            }
            routed.push(component.clone());
        }

        match self.check_health(&env).await {
            Ok(()) => StepOutcome::Recovered(format!("operating on recovery environment {env}")),
            Err(reason) => {
                self.route_back(&routed).await;
                self.discard(&env).await;
                StepOutcome::Failed(format!("recovery environment {env} unhealthy: {reason}"))
            }
        }
    }

    /// Level 3: full stack from geo backups in the secondary region, then all
    /// traffic moves there
    pub(crate) async fn fail_over_region(
        &self,
        incident: &DrIncident,
        token: &CancellationToken,
    ) -> StepOutcome {
        let stack: BTreeSet<String> = self
            .config
            .monitored_components
            .iter()
            .chain(&incident.trigger.components)
            .cloned()
            .collect();
        let order = match self.deploy_order(&stack).await {
            Ok(order) => order,
            Err(err) => return StepOutcome::Failed(format!("failover plan: {err}")),
        };

        let region = self.config.secondary_region.clone();
        let spec = EnvironmentSpec {
            name: format!("failover-{}", incident.id),
            region: region.clone(),
            components: order.clone(),
            purpose: EnvPurpose::Failover,
        };
        let env = match self.provision(&spec).await {
            Ok(env) => env,
            Err(err) => return StepOutcome::Failed(format!("failover environment: {err}")),
        };
        info!(env = %env, region = %region, "failover environment provisioned");

        if let Err(reason) = self.populate(&env, &order, Some(Tier::Geo)).await {
            self.discard(&env).await;
            return StepOutcome::Failed(reason);
        }
        if let Err(reason) = self.check_health(&env).await {
            self.discard(&env).await;
            return StepOutcome::Failed(format!("failover environment {env} unhealthy: {reason}"));
        }
        if token.is_cancelled() {
            self.discard(&env).await;
            return StepOutcome::Cancelled;
        }

        match self.traffic.failover(&order, &env).await {
            Ok(()) => StepOutcome::Recovered(format!(
                "operating on failover environment {env} in {region}"
            )),
            Err(err) => StepOutcome::Failed(format!("switching traffic to {env}: {err}")),
        }
    }

    // -----------------------------------------------------------------------

    async fn provision(&self, spec: &EnvironmentSpec) -> Result<EnvId, DrxError> {
        with_timeout(
            "create_environment",
            self.config.operation_timeout(),
            self.ports.control.create_environment(spec),
        )
        .await
    }

    /// Restore each component's newest validated backup into `env` and
    /// deploy its current version there
    ///
    /// Data stores without a validated backup fail the step; services are
    /// deployed without data.
    async fn populate(
        &self,
        env: &EnvId,
        components: &[String],
        tier: Option<Tier>,
    ) -> Result<(), String> {
        let limit = self.config.operation_timeout();
        for component in components {
            let record = self
                .versions
                .current(component)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("no deployed version recorded for {component}"))?;

            let manifest = self
                .manifests
                .latest_restorable(component, tier)
                .await
                .map_err(|e| e.to_string())?;
            match manifest {
                Some(manifest) => {
                    let bytes = with_timeout(
                        "restore_download",
                        limit,
                        self.ports.store.get(&manifest.storage_location),
                    )
                    .await
                    .map_err(|e| format!("downloading backup of {component}: {e}"))?;
                    if Checksum::compute(&bytes) != manifest.checksum {
                        return Err(format!(
                            "backup {} no longer matches its checksum",
                            manifest.storage_location
                        ));
                    }
                    with_timeout(
                        "restore",
                        limit,
                        self.ports
                            .dumper
                            .restore(&DumpTarget::in_env(component.clone(), env.clone()), &bytes),
                    )
                    .await
                    .map_err(|e| format!("restoring {component}: {e}"))?;
                    info!(component, manifest = %manifest.id, env = %env, "backup restored");
                }
                None if record.kind == ComponentKind::DataStore => {
                    return Err(format!("no validated backup for data store {component}"));
                }
                None => {}
            }

            with_timeout(
                "deploy",
                limit,
                self.ports
                    .control
                    .deploy_artifact(env, component, &record.current_version),
            )
            .await
            .map_err(|e| format!("deploying {component}: {e}"))?;
        }
        Ok(())
    }

    /// Shared bases first so dependents come up against live dependencies
    async fn deploy_order(&self, components: &BTreeSet<String>) -> Result<Vec<String>, DrxError> {
        let mut records = Vec::with_capacity(components.len());
        for component in components {
            let record = self
                .versions
                .current(component)
                .await?
                .ok_or_else(|| DrxError::NotFound(format!("version record for {component}")))?;
            records.push(record);
        }
        Ok(DependencyGraph::from_records(&records)?.deploy_order()?)
    }

    pub(crate) async fn check_health(&self, env: &EnvId) -> Result<(), String> {
        let reading = with_timeout(
            "health_check",
            self.config.operation_timeout(),
            self.ports.control.health_check(env),
        )
        .await
        .map_err(|e| e.to_string())?;
        match self.config.thresholds.violation(&reading) {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    async fn route_back(&self, components: &[String]) {
        if components.is_empty() {
            return;
        }
        if let Err(err) = self
            .traffic
            .failover(components, &self.config.primary_env)
            .await
        {
            warn!(error = %err, "could not return traffic to primary");
        }
    }

    async fn discard(&self, env: &EnvId) {
        match with_timeout(
            "delete_environment",
            self.config.operation_timeout(),
            self.ports.control.delete_environment(env),
        )
        .await
        {
            Ok(()) => info!(env = %env, "environment discarded"),
            Err(err) => warn!(env = %env, error = %err, "environment could not be deleted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drx_core::store::VersionRegistry;
    use drx_core::{
        ComponentVersionRecord, DrConfig, DrLevel, IncidentTrigger, RolloutConfig, TriggerSource,
    };
    use drx_test_utils::{t0, TestEnv};
    use drx_traffic::TrafficShiftController;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn controller(env: &TestEnv) -> DrController {
        let traffic = Arc::new(TrafficShiftController::new(
            RolloutConfig::default(),
            env.rollouts.clone(),
            &env.collaborators(),
        ));
        DrController::new(
            DrConfig::default(),
            &env.stores(),
            env.collaborators(),
            traffic,
        )
    }

    fn incident(level: DrLevel) -> DrIncident {
        DrIncident::open(
            IncidentTrigger::new(vec!["api".into()], "down", TriggerSource::Operator, level),
            t0(),
        )
    }

    #[tokio::test]
    async fn cancelled_recovery_deletes_untouched_environment() {
        let env = TestEnv::new();
        env.versions
            .record(ComponentVersionRecord::new("api", "2.1.0", t0()))
            .await
            .unwrap();
        let dr = controller(&env);
        let token = CancellationToken::new();
        token.cancel();

        let outcome = dr
            .recover_in_parallel(&incident(DrLevel::ServiceOutage), &token)
            .await;

        assert_eq!(outcome, StepOutcome::Cancelled);
        assert_eq!(env.control.deleted_envs(), vec![EnvId::new("recovery-1")]);
        assert!(env.control.splits().is_empty());
    }

    #[tokio::test]
    async fn data_store_without_backup_fails_recovery() {
        let env = TestEnv::new();
        env.versions
            .record(
                ComponentVersionRecord::new("api", "5.0.0", t0()).with_kind(ComponentKind::DataStore),
            )
            .await
            .unwrap();
        let dr = controller(&env);

        let outcome = dr
            .recover_in_parallel(&incident(DrLevel::ServiceOutage), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, StepOutcome::Failed(reason) if reason.contains("no validated backup")));
        assert_eq!(env.control.deleted_envs().len(), 1);
    }

    #[tokio::test]
    async fn unhealthy_recovery_environment_returns_traffic() {
        let env = TestEnv::new();
        env.versions
            .record(ComponentVersionRecord::new("api", "2.1.0", t0()))
            .await
            .unwrap();
        env.control
            .set_default_health(&EnvId::new("recovery-1"), drx_test_utils::erroring(0.4));
        let dr = controller(&env);

        let outcome = dr
            .recover_in_parallel(&incident(DrLevel::ServiceOutage), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, StepOutcome::Failed(_)));
        let split = env.control.last_split("api").unwrap();
        assert_eq!(split.get(&EnvId::new("primary")), Some(&100));
        assert_eq!(split.len(), 1);
    }

    #[tokio::test]
    async fn failover_deploys_bases_first() {
        let env = TestEnv::new();
        env.versions
            .record(
                ComponentVersionRecord::new("api", "2.0.0", t0())
                    .with_dependency(drx_core::ComponentRef::new("database", "9.0.0")),
            )
            .await
            .unwrap();
        env.versions
            .record(ComponentVersionRecord::new("database", "9.0.0", t0()))
            .await
            .unwrap();
        let dr = controller(&env);

        let order = dr
            .deploy_order(&["api".to_string(), "database".to_string()].into_iter().collect())
            .await
            .unwrap();
        assert_eq!(order, vec!["database".to_string(), "api".to_string()]);
    }
}
