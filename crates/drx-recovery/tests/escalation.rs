//! End-to-end escalation against in-memory fakes

use chrono::Duration as ChronoDuration;
use drx_core::store::VersionRegistry;
use drx_core::{
    AlertCategory, AlertSeverity, ComponentKind, ComponentRef, ComponentVersionRecord, DrConfig,
    DrLevel, DumpTarget, EnvId, EnvPurpose, IncidentStatus, IncidentTrigger, RollbackConfig,
    RolloutConfig, Tier, TriggerSource,
};
use drx_recovery::{DrController, HealthMonitor};
use drx_rollback::RollbackManager;
use drx_test_utils::{erroring, t0, TestEnv};
use drx_traffic::TrafficShiftController;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn primary() -> EnvId {
    EnvId::new("primary")
}

fn dr_config() -> DrConfig {
    DrConfig {
        monitored_components: vec!["agent-coordinator".into(), "database".into()],
        ..DrConfig::default()
    }
}

fn controller(env: &TestEnv) -> DrController {
    let traffic = Arc::new(TrafficShiftController::new(
        RolloutConfig::default(),
        env.rollouts.clone(),
        &env.collaborators(),
    ));
    DrController::new(dr_config(), &env.stores(), env.collaborators(), traffic)
}

async fn deployed_stack(env: &TestEnv) -> anyhow::Result<()> {
    env.versions
        .record(
            ComponentVersionRecord::new("database", "14.2", t0()).with_kind(ComponentKind::DataStore),
        )
        .await?;
    env.versions
        .record(
            ComponentVersionRecord::new("agent-coordinator", "1.4.0", t0())
                .with_dependency(ComponentRef::new("database", "14.2")),
        )
        .await?;
    Ok(())
}

fn degraded(component: &str) -> IncidentTrigger {
    IncidentTrigger::new(
        vec![component.to_string()],
        "p95 latency 4s",
        TriggerSource::Monitoring,
        DrLevel::ServiceDegradation,
    )
}

#[tokio::test(start_paused = true)]
async fn failed_restart_escalates_to_parallel_environment() -> anyhow::Result<()> {
    let env = TestEnv::new();
    deployed_stack(&env).await?;
    let hour = ChronoDuration::hours(1);
    env.seed_manifest("agent-coordinator", Tier::Hot, t0() - hour * 2, b"older", true)
        .await;
    env.seed_manifest("agent-coordinator", Tier::Hot, t0() - hour, b"newest", true)
        .await;
    env.seed_manifest("agent-coordinator", Tier::Hot, t0(), b"unvalidated", false)
        .await;
    env.control
        .script_health(&primary(), [erroring(0.2), erroring(0.2)]);

    let dr = controller(&env);
    let opened = dr.handle_trigger(degraded("agent-coordinator")).await?;
    let incident = dr.drive(opened.id).await?;

    assert_eq!(
        env.control.restarts(),
        vec![(primary(), "agent-coordinator".to_string())]
    );
    let levels: Vec<_> = incident.level_history.iter().map(|c| c.level).collect();
    assert_eq!(levels, vec![DrLevel::ServiceDegradation, DrLevel::ServiceOutage]);
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert!(incident
        .annotations
        .iter()
        .any(|a| a == "operating on recovery environment recovery-1"));

    let recovery = EnvId::new("recovery-1");
    let created = env.control.created_envs();
    let (_, spec) = &created[0];
    assert_eq!(spec.purpose, EnvPurpose::Recovery);
    assert_eq!(
        env.dumper.restores(),
        vec![(
            DumpTarget::in_env("agent-coordinator", recovery.clone()),
            b"newest".to_vec()
        )]
    );
    assert_eq!(
        env.control.deployed_version(&recovery, "agent-coordinator").as_deref(),
        Some("1.4.0")
    );
    let split = env.control.last_split("agent-coordinator").unwrap_or_default();
    assert_eq!(split.get(&recovery), Some(&10));
    assert_eq!(split.get(&primary()), Some(&90));

    assert!(env.alerts.has(AlertCategory::Escalation));
    assert!(env.alerts.has(AlertCategory::Recovered));
    assert!(dr.active().await?.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn regional_failover_uses_geo_backups() -> anyhow::Result<()> {
    let env = TestEnv::new();
    deployed_stack(&env).await?;
    env.seed_manifest("database", Tier::Hot, t0(), b"hot", true).await;
    env.seed_manifest("database", Tier::Geo, t0() - ChronoDuration::hours(6), b"geo", true)
        .await;

    let dr = controller(&env);
    let opened = dr
        .declare(vec!["database".into()], "us-east-1 unreachable", DrLevel::RegionalLoss)
        .await?;
    let incident = dr.drive(opened.id).await?;

    assert_eq!(incident.level, DrLevel::RegionalLoss);
    assert_eq!(incident.status, IncidentStatus::Resolved);

    let failover = EnvId::new("failover-1");
    let created = env.control.created_envs();
    let (_, spec) = &created[0];
    assert_eq!(spec.region, "us-west-2");
    assert_eq!(
        env.dumper.restores(),
        vec![(DumpTarget::in_env("database", failover.clone()), b"geo".to_vec())]
    );
    let order: Vec<_> = env
        .control
        .deployments()
        .into_iter()
        .map(|d| d.component)
        .collect();
    assert_eq!(order, vec!["database", "agent-coordinator"]);
    for component in ["database", "agent-coordinator"] {
        let split = env.control.last_split(component).unwrap_or_default();
        assert_eq!(split.get(&failover), Some(&100));
        assert_eq!(split.len(), 1);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_levels_freeze_automation() -> anyhow::Result<()> {
    let env = TestEnv::new();
    deployed_stack(&env).await?;
    // No backups of the database anywhere: levels 2 and 3 cannot restore it.
    env.control
        .script_health(&primary(), [erroring(0.9), erroring(0.9)]);

    let dr = controller(&env);
    let opened = dr.handle_trigger(degraded("database")).await?;
    let incident = dr.drive(opened.id).await?;

    let levels: Vec<_> = incident.level_history.iter().map(|c| c.level).collect();
    assert_eq!(
        levels,
        vec![
            DrLevel::ServiceDegradation,
            DrLevel::ServiceOutage,
            DrLevel::RegionalLoss,
            DrLevel::Catastrophic
        ]
    );
    assert_eq!(incident.status, IncidentStatus::Escalated);
    assert!(incident.automation_frozen);
    assert_eq!(env.alerts.max_severity(), Some(AlertSeverity::Page));
    assert_eq!(env.alerts.count(AlertCategory::ManualIntervention), 1);
    // Both provisioned environments were torn down.
    assert_eq!(env.control.deleted_envs().len(), 2);

    // Frozen: later triggers are evidence only.
    let again = dr.handle_trigger(degraded("database")).await?;
    assert_eq!(again.id, incident.id);
    assert_eq!(again.evidence.len(), 1);

    // A human resumes automation.
    let resolved = dr.resolve(incident.id, "oncall").await?;
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert!(!resolved.automation_frozen);
    let next = dr.handle_trigger(degraded("database")).await?;
    assert_ne!(next.id, incident.id);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_in_flight_restart() -> anyhow::Result<()> {
    let env = TestEnv::new();
    deployed_stack(&env).await?;
    env.control.script_health(&primary(), [erroring(0.2)]);

    let dr = Arc::new(controller(&env));
    let opened = dr.handle_trigger(degraded("agent-coordinator")).await?;
    let driver = {
        let dr = dr.clone();
        tokio::spawn(async move { dr.drive(opened.id).await })
    };

    // The first health check failed; the controller now waits a poll interval.
    tokio::time::sleep(Duration::from_secs(5)).await;
    dr.cancel(opened.id, "oncall").await?;
    let incident = driver.await??;

    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(incident.level, DrLevel::ServiceDegradation);
    assert!(incident
        .annotations
        .contains(&"automation cancelled by oncall".to_string()));
    assert!(env.control.created_envs().is_empty());
    Ok(())
}

#[tokio::test]
async fn rollback_runs_under_open_incident() -> anyhow::Result<()> {
    let env = TestEnv::new();
    for (version, hour) in [("1.3.0", 0), ("1.4.0", 1)] {
        env.versions
            .record(ComponentVersionRecord::new(
                "agent-coordinator",
                version,
                t0() + ChronoDuration::hours(hour),
            ))
            .await?;
    }
    let manager = Arc::new(RollbackManager::new(
        RollbackConfig::default(),
        primary(),
        env.stores(),
        env.collaborators(),
    ));
    let dr = controller(&env).with_rollback_manager(manager);
    let incident = dr.handle_trigger(degraded("agent-coordinator")).await?;

    let report = dr
        .rollback(incident.id, &[ComponentRef::new("agent-coordinator", "1.3.0")])
        .await?;

    assert!(report.is_success());
    assert_eq!(
        env.control.deployed_version(&primary(), "agent-coordinator").as_deref(),
        Some("1.3.0")
    );
    let incident = dr.incident(incident.id).await?.unwrap_or(incident);
    assert!(incident
        .annotations
        .contains(&"rolled back agent-coordinator".to_string()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn monitor_and_controller_recover_together() -> anyhow::Result<()> {
    let env = TestEnv::new();
    deployed_stack(&env).await?;
    env.control.script_health(&primary(), [erroring(0.5)]);

    let dr = Arc::new(controller(&env));
    let (tx, rx) = mpsc::channel(16);
    let monitor = HealthMonitor::new(dr_config(), env.control.clone(), tx);
    let cancel = CancellationToken::new();

    let controller_task = {
        let dr = dr.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dr.run(rx, cancel).await })
    };
    let monitor_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(30)).await;
    cancel.cancel();
    monitor_task.await?;
    controller_task.await?;

    let history = dr.history().await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].trigger.source, TriggerSource::HealthPoll);
    assert_eq!(history[0].status, IncidentStatus::Resolved);
    assert_eq!(history[0].level, DrLevel::ServiceDegradation);
    Ok(())
}

#[tokio::test]
async fn failed_rollback_escalates_incident() -> anyhow::Result<()> {
    let env = TestEnv::new();
    for (version, hour) in [("1.3.0", 0), ("1.4.0", 1)] {
        env.versions
            .record(ComponentVersionRecord::new(
                "agent-coordinator",
                version,
                t0() + ChronoDuration::hours(hour),
            ))
            .await?;
    }
    env.control.mark_bad_version("agent-coordinator", "1.3.0");
    let manager = Arc::new(RollbackManager::new(
        RollbackConfig::default(),
        primary(),
        env.stores(),
        env.collaborators(),
    ));
    let dr = controller(&env).with_rollback_manager(manager);
    let incident = dr.handle_trigger(degraded("agent-coordinator")).await?;

    let report = dr
        .rollback(incident.id, &[ComponentRef::new("agent-coordinator", "1.3.0")])
        .await?;

    assert!(!report.is_success());
    let incident = dr.incident(incident.id).await?.unwrap_or(incident);
    assert_eq!(incident.level, DrLevel::ServiceOutage);
    assert_eq!(
        env.control.deployed_version(&primary(), "agent-coordinator").as_deref(),
        Some("1.4.0")
    );
    Ok(())
}
