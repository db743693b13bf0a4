//! End-to-end backup pipeline against in-memory fakes

use drx_backup::BackupScheduler;
use drx_core::store::{IncidentTable, ManifestIndex};
use drx_core::{
    AlertCategory, BackupConfig, BackupTarget, ComponentKind, DumpFormat, DumpTarget, JobStatus,
    RetryPolicy, Tier,
};
use drx_test_utils::TestEnv;
use pretty_assertions::assert_eq;
use std::time::Duration;

fn scheduler(env: &TestEnv) -> BackupScheduler {
    let mut config = BackupConfig::default();
    config.retry = RetryPolicy::new(3, Duration::from_secs(1));
    config.operation_timeout_secs = 30;
    config.targets = vec![BackupTarget::new(
        "database",
        ComponentKind::DataStore,
        DumpFormat::Sql,
    )];
    BackupScheduler::new(
        config,
        env.dumper.clone(),
        env.store.clone(),
        env.manifests.clone(),
        env.alerts.clone(),
    )
}

#[tokio::test(start_paused = true)]
async fn hot_database_backup_is_validated_within_five_seconds() {
    let env = TestEnv::new();
    env.dumper.set_state(
        DumpTarget::primary("database"),
        "CREATE TABLE agents (id text primary key);\nINSERT INTO agents VALUES ('a1');\n",
    );
    env.dumper.set_dump_delay(Some(Duration::from_secs(2)));
    let scheduler = scheduler(&env);

    let started = tokio::time::Instant::now();
    let job = scheduler.run_job(Tier::Hot, "database").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(job.status, JobStatus::Uploaded);
    assert!(job.validated);
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed <= Duration::from_secs(5));

    let manifest = env
        .manifests
        .latest_restorable("database", Some(Tier::Hot))
        .await
        .unwrap()
        .expect("validated manifest");
    assert_eq!(manifest.job_id, Some(job.id));
    assert_eq!(Some(manifest.checksum), job.checksum);
    assert!(manifest.validated_at.is_some());
    assert!(env.alerts.alerts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn corrupt_upload_is_never_a_restore_candidate() {
    let env = TestEnv::new();
    env.dumper
        .set_state(DumpTarget::primary("database"), "CREATE TABLE t (x int);\n");
    let scheduler = scheduler(&env);

    let good = scheduler.run_job(Tier::Hot, "database").await.unwrap();
    assert!(good.validated);

    env.store.corrupt_next_puts(1);
    let damaged = scheduler.run_job(Tier::Warm, "database").await.unwrap();

    assert_eq!(damaged.status, JobStatus::Uploaded);
    assert!(!damaged.validated);
    assert_eq!(env.alerts.count(AlertCategory::Validation), 1);
    assert_eq!(AlertCategory::Validation.as_str(), "validation_error");

    let all = env.manifests.list(Some("database"), None).await.unwrap();
    assert_eq!(all.len(), 2);
    let rejected = all
        .iter()
        .find(|m| m.job_id == Some(damaged.id))
        .expect("corrupt manifest recorded");
    assert!(rejected.validated_at.is_none());

    let chosen = env
        .manifests
        .latest_restorable("database", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chosen.job_id, Some(good.id));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_job_without_escalating() {
    let env = TestEnv::new();
    env.store.fail_all_puts(true);
    let scheduler = scheduler(&env);

    let job = scheduler.run_job(Tier::Geo, "database").await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.error.is_some());
    assert!(env.manifests.is_empty());
    assert_eq!(env.alerts.count(AlertCategory::RetriesExhausted), 1);
    assert!(env.incidents.history().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn upload_timeout_counts_as_failure() {
    let env = TestEnv::new();
    env.store.set_put_delay(Some(Duration::from_secs(120)));
    let scheduler = scheduler(&env);

    let job = scheduler.run_job(Tier::Hot, "database").await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("timed out"));
}
