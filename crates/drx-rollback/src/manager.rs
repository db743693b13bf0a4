//! Rollback manager
//!
//! Per component the steps are strictly sequential: resolve the plan, take
//! and persist a safety snapshot, apply the rollback, smoke-test. Nothing
//! destructive happens before the snapshot is durable. A failed smoke test
//! restores that exact snapshot and redeploys the version that was running.

use crate::graph::DependencyGraph;
use chrono::Utc;
use drx_core::store::Stores;
use drx_core::telemetry::ROLLBACKS_TOTAL;
use drx_core::{
    with_timeout, AlertCategory, AlertContext, AlertSeverity, BackupManifest, Checksum,
    Collaborators, ComponentKind, ComponentRef, ComponentVersionRecord, DrxError, DumpTarget,
    EnvId, ManifestId, RollbackConfig, StorageClass,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, instrument, warn};

const PHASE: &str = "rollback";

/// How a component's rollback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Succeeded,
    /// Already at the target version
    Skipped,
    Failed,
    /// Not reached because an earlier component failed
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRollback {
    pub component: String,
    pub from_version: Option<String>,
    pub to_version: String,
    pub status: RollbackStatus,
    /// Artifact key of the safety snapshot, once taken
    pub safety_snapshot: Option<String>,
    /// Manifest restored for a data store
    pub restored_manifest: Option<ManifestId>,
    pub error: Option<String>,
}

impl ComponentRollback {
    fn pending(component: &str, to_version: &str) -> Self {
        Self {
            component: component.to_string(),
            from_version: None,
            to_version: to_version.to_string(),
            status: RollbackStatus::NotAttempted,
            safety_snapshot: None,
            restored_manifest: None,
            error: None,
        }
    }
}

/// Result of a multi-component rollback, in processing order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub results: Vec<ComponentRollback>,
}

impl RollbackReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r.status, RollbackStatus::Succeeded | RollbackStatus::Skipped))
    }

    /// Components in the order they were processed
    #[must_use]
    pub fn order(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.component.as_str()).collect()
    }

    #[must_use]
    pub fn failed(&self) -> Option<&ComponentRollback> {
        self.results
            .iter()
            .find(|r| r.status == RollbackStatus::Failed)
    }
}

/// What a single rollback will do, resolved before anything is touched
struct Plan {
    current: ComponentVersionRecord,
    target: String,
    target_record: Option<ComponentVersionRecord>,
    restore_point: Option<BackupManifest>,
}

pub struct RollbackManager {
    config: RollbackConfig,
    primary_env: EnvId,
    stores: Stores,
    ports: Collaborators,
}

impl RollbackManager {
    pub fn new(
        config: RollbackConfig,
        primary_env: EnvId,
        stores: Stores,
        ports: Collaborators,
    ) -> Self {
        Self {
            config,
            primary_env,
            stores,
            ports,
        }
    }

    /// Roll `name` back to its recorded rollback target
    ///
    /// # Errors
    /// `NotFound` if the component has no record or no rollback target,
    /// otherwise as [`Self::rollback_component`].
    pub async fn rollback_to_previous(&self, name: &str) -> Result<ComponentRollback, DrxError> {
        let current = self
            .stores
            .versions
            .current(name)
            .await?
            .ok_or_else(|| DrxError::NotFound(format!("version record for {name}")))?;
        let target = current
            .rollback_target
            .clone()
            .ok_or_else(|| DrxError::NotFound(format!("rollback target for {name}")))?;
        self.rollback_component(name, &target).await
    }

    /// Roll one component back to `target_version`
    ///
    /// # Errors
    /// - `NotFound` when there is no version record, or a data store has no
    ///   validated backup at or before the target's deploy time
    /// - `ConcurrencyViolation` when a rollback of the component is running
    /// - `SafetySnapshotFailure` when the snapshot could not be persisted;
    ///   nothing was changed
    /// - `RollbackFailed` when the rollback was applied but failed, after the
    ///   safety snapshot was restored
    #[instrument(skip(self), fields(env = %self.primary_env))]
    pub async fn rollback_component(
        &self,
        name: &str,
        target_version: &str,
    ) -> Result<ComponentRollback, DrxError> {
        let mut outcome = ComponentRollback::pending(name, target_version);
        let plan = match self.plan(name, target_version).await {
            Ok(plan) => plan,
            Err(err) => {
                self.abort_unplanned(name, target_version, &err).await;
                return Err(err);
            }
        };
        outcome.from_version = Some(plan.current.current_version.clone());

        if plan.current.current_version == plan.target {
            info!("already at target version, nothing to do");
            outcome.status = RollbackStatus::Skipped;
            return Ok(outcome);
        }

        self.stores.migrations.start(name, PHASE).await?;

        let (snapshot_key, snapshot) = match self.take_safety_snapshot(name).await {
            Ok(taken) => taken,
            Err(err) => {
                self.finish_failed(name, &err).await;
                return Err(err);
            }
        };
        outcome.safety_snapshot = Some(snapshot_key);
        outcome.restored_manifest = plan.restore_point.as_ref().map(|m| m.id);

        if let Err(reason) = self.apply(name, &plan).await {
            let err = self.recover(name, &plan, &snapshot, reason).await;
            self.finish_failed(name, &err).await;
            return Err(err);
        }

        let mut record = ComponentVersionRecord::new(name, plan.target.clone(), Utc::now())
            .with_rollback_target(plan.current.current_version.clone())
            .with_kind(plan.current.kind);
        let deps = plan
            .target_record
            .as_ref()
            .map_or(&plan.current.dependencies, |r| &r.dependencies);
        for dep in deps {
            record = record.with_dependency(dep.clone());
        }
        if let Err(err) = self.stores.versions.record(record).await {
            self.finish_failed(name, &err).await;
            return Err(err);
        }
        self.stores.migrations.complete(name, PHASE).await?;

        info!(from = %plan.current.current_version, to = %plan.target, "rollback succeeded");
        metrics::counter!(ROLLBACKS_TOTAL, "outcome" => "succeeded").increment(1);
        outcome.status = RollbackStatus::Succeeded;
        Ok(outcome)
    }

    /// Roll back several components in dependency order
    ///
    /// Dependents go first and shared bases last. The chain stops at the first
    /// failure; later components are reported as not attempted. With
    /// `parallel` set, each layer of independent components runs concurrently.
    ///
    /// # Errors
    /// `NotFound` for unknown components and `DependencyOrder` for cyclic
    /// dependencies, both before anything is touched.
    pub async fn rollback_set(&self, targets: &[ComponentRef]) -> Result<RollbackReport, DrxError> {
        let mut wanted = BTreeMap::new();
        let mut records = Vec::with_capacity(targets.len());
        for target in targets {
            let record = self
                .stores
                .versions
                .current(&target.name)
                .await?
                .ok_or_else(|| DrxError::NotFound(format!("version record for {}", target.name)))?;
            wanted.insert(target.name.clone(), target.version.clone());
            records.push(record);
        }

        let ordered = DependencyGraph::from_records(&records).and_then(|graph| {
            if self.config.parallel {
                graph.rollback_layers()
            } else {
                graph
                    .rollback_order()
                    .map(|order| order.into_iter().map(|c| vec![c]).collect())
            }
        });
        let layers = match ordered {
            Ok(layers) => layers,
            Err(err) => {
                let err = DrxError::from(err);
                error!(error = %err, "cannot order rollback");
                self.ports
                    .alerter
                    .send_alert(
                        AlertSeverity::Critical,
                        &err.to_string(),
                        AlertContext::new(AlertCategory::DependencyOrder),
                    )
                    .await;
                return Err(err);
            }
        };
        info!(?layers, "rollback order resolved");

        let mut results = Vec::with_capacity(targets.len());
        let mut stopped = false;
        for layer in layers {
            if stopped {
                results.extend(
                    layer
                        .iter()
                        .map(|c| ComponentRollback::pending(c, &wanted[c])),
                );
                continue;
            }
            let runs = layer.iter().map(|c| self.rollback_or_report(c, &wanted[c]));
            for result in join_all(runs).await {
                stopped |= result.status == RollbackStatus::Failed;
                results.push(result);
            }
        }
        Ok(RollbackReport { results })
    }

    async fn rollback_or_report(&self, name: &str, version: &str) -> ComponentRollback {
        match self.rollback_component(name, version).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let mut failed = ComponentRollback::pending(name, version);
                failed.status = RollbackStatus::Failed;
                failed.error = Some(err.to_string());
                failed
            }
        }
    }

    async fn plan(&self, name: &str, target: &str) -> Result<Plan, DrxError> {
        let current = self
            .stores
            .versions
            .current(name)
            .await?
            .ok_or_else(|| DrxError::NotFound(format!("version record for {name}")))?;
        let target_record = self.stores.versions.find(name, target).await?;

        let restore_point = if current.kind == ComponentKind::DataStore
            && current.current_version != target
        {
            let deployed_at = target_record
                .as_ref()
                .map(|r| r.deployed_at)
                .ok_or_else(|| DrxError::NotFound(format!("{name}@{target} was never deployed")))?;
            let manifest = self
                .stores
                .manifests
                .restorable_at_or_before(name, deployed_at)
                .await?
                .ok_or_else(|| {
                    DrxError::NotFound(format!(
                        "validated backup of {name} at or before {deployed_at}"
                    ))
                })?;
            Some(manifest)
        } else {
            None
        };

        Ok(Plan {
            current,
            target: target.to_string(),
            target_record,
            restore_point,
        })
    }

    async fn take_safety_snapshot(&self, name: &str) -> Result<(String, Vec<u8>), DrxError> {
        let limit = self.config.operation_timeout();
        let failure = |reason: String| DrxError::SafetySnapshotFailure {
            component: name.to_string(),
            reason,
        };

        let bytes = with_timeout(
            "safety_dump",
            limit,
            self.ports.dumper.dump(&DumpTarget::primary(name)),
        )
        .await
        .map_err(|e| failure(e.to_string()))?;

        let key = format!(
            "{}/{}/{}",
            self.config.safety_prefix,
            name,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        );
        with_timeout(
            "safety_upload",
            limit,
            self.ports
                .store
                .put(&key, bytes.clone(), StorageClass::Standard),
        )
        .await
        .map_err(|e| failure(e.to_string()))?;

        // Read back: a snapshot we cannot fetch is not a snapshot.
        let stored = with_timeout("safety_verify", limit, self.ports.store.get(&key))
            .await
            .map_err(|e| failure(e.to_string()))?;
        if Checksum::compute(&stored) != Checksum::compute(&bytes) {
            return Err(failure(format!("snapshot at {key} does not read back intact")));
        }

        info!(key = %key, size_bytes = bytes.len(), "safety snapshot persisted");
        Ok((key, bytes))
    }

    /// Deploy the target and, for data stores, restore its data; then smoke-test
    async fn apply(&self, name: &str, plan: &Plan) -> Result<(), String> {
        let limit = self.config.operation_timeout();
        let control = &self.ports.control;

        if let Some(manifest) = &plan.restore_point {
            let bytes = with_timeout(
                "restore_download",
                limit,
                self.ports.store.get(&manifest.storage_location),
            )
            .await
            .map_err(|e| e.to_string())?;
            if Checksum::compute(&bytes) != manifest.checksum {
                return Err(format!(
                    "backup {} no longer matches its checksum",
                    manifest.storage_location
                ));
            }
            with_timeout(
                "restore",
                limit,
                self.ports.dumper.restore(&DumpTarget::primary(name), &bytes),
            )
            .await
            .map_err(|e| e.to_string())?;
            info!(manifest = %manifest.id, "data restored from backup");
        }

        with_timeout(
            "deploy",
            limit,
            control.deploy_artifact(&self.primary_env, name, &plan.target),
        )
        .await
        .map_err(|e| e.to_string())?;

        let reading = with_timeout("smoke_test", limit, control.health_check(&self.primary_env))
            .await
            .map_err(|e| format!("smoke test: {e}"))?;
        match self.config.smoke_test.violation(&reading) {
            Some(violation) => Err(format!("smoke test: {violation}")),
            None => Ok(()),
        }
    }

    /// Put back the safety snapshot and the version that was running
    async fn recover(&self, name: &str, plan: &Plan, snapshot: &[u8], reason: String) -> DrxError {
        warn!(reason = %reason, "rollback failed, restoring safety snapshot");
        let limit = self.config.operation_timeout();
        let mut problems = Vec::new();

        if let Err(e) = with_timeout(
            "snapshot_restore",
            limit,
            self.ports.dumper.restore(&DumpTarget::primary(name), snapshot),
        )
        .await
        {
            problems.push(format!("snapshot restore failed: {e}"));
        }
        if let Err(e) = with_timeout(
            "redeploy",
            limit,
            self.ports.control.deploy_artifact(
                &self.primary_env,
                name,
                &plan.current.current_version,
            ),
        )
        .await
        {
            problems.push(format!("redeploy of {} failed: {e}", plan.current.current_version));
        }

        if !problems.is_empty() {
            error!(problems = ?problems, "component left in unknown state");
            self.ports
                .alerter
                .send_alert(
                    AlertSeverity::Page,
                    &format!("{name} could not be returned to its pre-rollback state"),
                    AlertContext::new(AlertCategory::ManualIntervention)
                        .with_component(name)
                        .with("problems", problems.join("; ")),
                )
                .await;
        }

        DrxError::RollbackFailed {
            component: name.to_string(),
            reason: if problems.is_empty() {
                reason
            } else {
                format!("{reason}; {}", problems.join("; "))
            },
        }
    }

    /// Nothing was touched and no migration entry was opened
    async fn abort_unplanned(&self, name: &str, target: &str, err: &DrxError) {
        error!(error = %err, target, "rollback aborted before any change");
        metrics::counter!(ROLLBACKS_TOTAL, "outcome" => "aborted").increment(1);
        self.ports
            .alerter
            .send_alert(
                AlertSeverity::Critical,
                &format!("rollback of {name} to {target} aborted: {err}"),
                AlertContext::new(AlertCategory::RollbackFailed)
                    .with_component(name)
                    .with("target_version", target),
            )
            .await;
    }

    async fn finish_failed(&self, name: &str, err: &DrxError) {
        error!(error = %err, "rollback failed");
        metrics::counter!(ROLLBACKS_TOTAL, "outcome" => "failed").increment(1);
        if let Err(log_err) = self.stores.migrations.fail(name, PHASE, &err.to_string()).await {
            warn!(error = %log_err, "could not close migration log entry");
        }
        self.ports
            .alerter
            .send_alert(
                AlertSeverity::Critical,
                &format!("rollback of {name} failed: {err}"),
                AlertContext::new(err.alert_category()).with_component(name),
            )
            .await;
    }
}
