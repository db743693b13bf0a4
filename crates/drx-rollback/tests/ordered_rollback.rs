//! Multi-component rollback against in-memory fakes

use drx_core::store::{MigrationLog, VersionRegistry};
use drx_core::{
    AlertCategory, ComponentRef, ComponentVersionRecord, DrxError, EnvId, MigrationStatus,
    RollbackConfig,
};
use drx_rollback::{RollbackManager, RollbackStatus};
use drx_test_utils::{t0, TestEnv};
use pretty_assertions::assert_eq;

fn manager(env: &TestEnv, parallel: bool) -> RollbackManager {
    let config = RollbackConfig {
        parallel,
        ..RollbackConfig::default()
    };
    RollbackManager::new(
        config,
        EnvId::new("primary"),
        env.stores(),
        env.collaborators(),
    )
}

/// Two releases of each component; `deps` apply to both
async fn release(env: &TestEnv, name: &str, deps: &[&str]) {
    for (hour, version) in [(0, "1.0.0"), (1, "2.0.0")] {
        let mut record =
            ComponentVersionRecord::new(name, version, t0() + chrono::Duration::hours(hour));
        for dep in deps {
            record = record.with_dependency(ComponentRef::new(*dep, version));
        }
        if version == "2.0.0" {
            record = record.with_rollback_target("1.0.0");
        }
        env.versions.record(record).await.unwrap();
    }
}

fn targets(names: &[&str]) -> Vec<ComponentRef> {
    names.iter().map(|n| ComponentRef::new(*n, "1.0.0")).collect()
}

#[tokio::test]
async fn chain_rolls_back_dependents_before_their_bases() {
    let env = TestEnv::new();
    // gateway depends on scheduler depends on ledger
    release(&env, "gateway", &["scheduler"]).await;
    release(&env, "scheduler", &["ledger"]).await;
    release(&env, "ledger", &[]).await;

    let report = manager(&env, false)
        .rollback_set(&targets(&["ledger", "gateway", "scheduler"]))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.order(), vec!["gateway", "scheduler", "ledger"]);

    let deployed: Vec<_> = env
        .control
        .deployments()
        .into_iter()
        .map(|d| d.component)
        .collect();
    assert_eq!(deployed, vec!["gateway", "scheduler", "ledger"]);

    for name in ["gateway", "scheduler", "ledger"] {
        let current = env.versions.current(name).await.unwrap().unwrap();
        assert_eq!(current.current_version, "1.0.0");
    }
}

#[tokio::test]
async fn failure_stops_the_chain() {
    let env = TestEnv::new();
    release(&env, "gateway", &["scheduler"]).await;
    release(&env, "scheduler", &["ledger"]).await;
    release(&env, "ledger", &[]).await;
    env.control.mark_bad_version("scheduler", "1.0.0");

    let report = manager(&env, false)
        .rollback_set(&targets(&["gateway", "scheduler", "ledger"]))
        .await
        .unwrap();

    assert!(!report.is_success());
    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            RollbackStatus::Succeeded,
            RollbackStatus::Failed,
            RollbackStatus::NotAttempted
        ]
    );
    assert_eq!(report.failed().unwrap().component, "scheduler");
    assert!(env.alerts.has(AlertCategory::RollbackFailed));

    let ledger = env.versions.current("ledger").await.unwrap().unwrap();
    assert_eq!(ledger.current_version, "2.0.0");

    let entries = env.migrations.entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .any(|e| e.component == "scheduler" && e.status == MigrationStatus::Failed));
}

#[tokio::test]
async fn parallel_mode_runs_independent_components_together() {
    let env = TestEnv::new();
    release(&env, "web", &["database"]).await;
    release(&env, "agents", &["database"]).await;
    release(&env, "database", &[]).await;

    let report = manager(&env, true)
        .rollback_set(&targets(&["database", "web", "agents"]))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.order(), vec!["agents", "web", "database"]);
}

#[tokio::test]
async fn unknown_component_is_rejected_before_any_work() {
    let env = TestEnv::new();
    release(&env, "web", &[]).await;

    let err = manager(&env, false)
        .rollback_set(&targets(&["web", "ghost"]))
        .await
        .unwrap_err();

    assert!(matches!(err, DrxError::NotFound(_)));
    assert!(env.control.deployments().is_empty());
    assert!(env.store.keys().is_empty());
}
