//! Testing utilities for DRX workspace
//!
//! In-memory fakes of every external collaborator, with fault injection,
//! plus a [`TestEnv`] bundling them with in-memory stores.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use drx_core::store::{
    InMemoryIncidentTable, InMemoryManifestIndex, InMemoryMigrationLog, InMemoryRolloutStore,
    InMemoryVersionRegistry, ManifestIndex, Stores,
};
use drx_core::{
    Alert, AlertCategory, AlertContext, AlertSeverity, Alerter, ArtifactStore, BackupManifest,
    Checksum, Collaborators, DataDumper, DeploymentControlPlane, DrxError, DumpTarget, EnvId, EnvPurpose,
    EnvironmentSpec, HealthReading, ManifestId, StorageClass, Tier, TrafficSplit,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed reference instant for deterministic tests
#[must_use]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Reading well inside default thresholds
#[must_use]
pub fn healthy() -> HealthReading {
    HealthReading::new(0.001, 120.0)
}

/// Reading with an error rate of `rate`
#[must_use]
pub fn erroring(rate: f64) -> HealthReading {
    HealthReading::new(rate, 120.0)
}

// ---------------------------------------------------------------------------
// Artifact store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub class: StorageClass,
}

/// Artifact store backed by a map
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: DashMap<String, StoredObject>,
    put_failures: AtomicU32,
    corrupt_puts: AtomicU32,
    fail_all_puts: AtomicBool,
    fail_all_gets: AtomicBool,
    put_delay: Mutex<Option<Duration>>,
    puts: AtomicU32,
}

impl MemoryArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `n` puts fail with a transient error
    pub fn fail_next_puts(&self, n: u32) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    /// Next `n` puts succeed but store damaged bytes
    pub fn corrupt_next_puts(&self, n: u32) {
        self.corrupt_puts.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_puts(&self, fail: bool) {
        self.fail_all_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_all_gets(&self, fail: bool) {
        self.fail_all_gets.store(fail, Ordering::SeqCst);
    }

    /// Every put sleeps this long before completing
    pub fn set_put_delay(&self, delay: Option<Duration>) {
        *self.put_delay.lock() = delay;
    }

    /// Flip the first byte of a stored object
    pub fn corrupt(&self, key: &str) {
        if let Some(mut obj) = self.objects.get_mut(key) {
            match obj.bytes.first_mut() {
                Some(b) => *b ^= 0xff,
                None => obj.bytes.push(0xff),
            }
        }
    }

    /// Delete behind the validator's back
    pub fn remove_silently(&self, key: &str) {
        self.objects.remove(key);
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>, class: StorageClass) {
        self.objects
            .insert(key.to_string(), StoredObject { bytes, class });
    }

    #[must_use]
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|o| o.value().clone())
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, class: StorageClass) -> Result<(), DrxError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.put_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all_puts.load(Ordering::SeqCst) {
            return Err(DrxError::transient("put", "store unavailable"));
        }
        let remaining = self.put_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.put_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DrxError::transient("put", "503 slow down"));
        }
        let mut bytes = bytes;
        let damaged = self.corrupt_puts.load(Ordering::SeqCst);
        if damaged > 0 {
            self.corrupt_puts.store(damaged - 1, Ordering::SeqCst);
            bytes.push(0x00);
        }
        self.insert(key, bytes, class);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, DrxError> {
        if self.fail_all_gets.load(Ordering::SeqCst) {
            return Err(DrxError::transient("get", "store unavailable"));
        }
        self.objects
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| DrxError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, DrxError> {
        Ok(self
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), DrxError> {
        self.objects.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dump / restore
// ---------------------------------------------------------------------------

/// Dumper whose "state" is a byte blob per target
#[derive(Debug, Default)]
pub struct FakeDumper {
    state: DashMap<DumpTarget, Vec<u8>>,
    fail_dumps: AtomicBool,
    fail_restores: AtomicBool,
    dump_delay: Mutex<Option<Duration>>,
    restores: Mutex<Vec<(DumpTarget, Vec<u8>)>>,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl FakeDumper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, target: DumpTarget, bytes: impl Into<Vec<u8>>) {
        self.state.insert(target, bytes.into());
    }

    #[must_use]
    pub fn state_of(&self, target: &DumpTarget) -> Option<Vec<u8>> {
        self.state.get(target).map(|s| s.value().clone())
    }

    pub fn fail_dumps(&self, fail: bool) {
        self.fail_dumps.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restores(&self, fail: bool) {
        self.fail_restores.store(fail, Ordering::SeqCst);
    }

    pub fn set_dump_delay(&self, delay: Option<Duration>) {
        *self.dump_delay.lock() = delay;
    }

    #[must_use]
    pub fn restores(&self) -> Vec<(DumpTarget, Vec<u8>)> {
        self.restores.lock().clone()
    }

    /// Highest number of dumps observed running at once
    #[must_use]
    pub fn max_concurrent_dumps(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataDumper for FakeDumper {
    async fn dump(&self, target: &DumpTarget) -> Result<Vec<u8>, DrxError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.dump_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_dumps.load(Ordering::SeqCst) {
            return Err(DrxError::transient("dump", "connection refused"));
        }
        Ok(self
            .state_of(target)
            .unwrap_or_else(|| format!("state:{}", target.component).into_bytes()))
    }

    async fn restore(&self, target: &DumpTarget, bytes: &[u8]) -> Result<(), DrxError> {
        if self.fail_restores.load(Ordering::SeqCst) {
            return Err(DrxError::transient("restore", "restore rejected"));
        }
        self.restores.lock().push((target.clone(), bytes.to_vec()));
        self.state.insert(target.clone(), bytes.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub env: EnvId,
    pub component: String,
    pub version: String,
}

/// Control plane with scripted health and recorded side effects
///
/// Created environments are named `{purpose}-{n}` (e.g. `recovery-1`) so
/// tests can script their health before they exist.
#[derive(Debug, Default)]
pub struct FakeControlPlane {
    next_env: AtomicU32,
    environments: Mutex<BTreeMap<EnvId, EnvironmentSpec>>,
    deleted: Mutex<Vec<EnvId>>,
    deployments: Mutex<Vec<Deployment>>,
    deployed: Mutex<HashMap<(EnvId, String), String>>,
    splits: Mutex<Vec<(String, TrafficSplit)>>,
    scripted: Mutex<HashMap<EnvId, VecDeque<Result<HealthReading, DrxError>>>>,
    defaults: Mutex<HashMap<EnvId, HealthReading>>,
    bad_versions: Mutex<HashSet<(String, String)>>,
    restarts: Mutex<Vec<(EnvId, String)>>,
    health_checks: AtomicU32,
    fail_create: AtomicBool,
    fail_splits: AtomicBool,
}

impl FakeControlPlane {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue readings returned by the next health checks of `env`
    pub fn script_health(&self, env: &EnvId, readings: impl IntoIterator<Item = HealthReading>) {
        self.scripted
            .lock()
            .entry(env.clone())
            .or_default()
            .extend(readings.into_iter().map(Ok));
    }

    /// Queue a failing health check for `env`
    pub fn script_health_error(&self, env: &EnvId, err: DrxError) {
        self.scripted
            .lock()
            .entry(env.clone())
            .or_default()
            .push_back(Err(err));
    }

    /// Reading returned once the script for `env` is exhausted
    pub fn set_default_health(&self, env: &EnvId, reading: HealthReading) {
        self.defaults.lock().insert(env.clone(), reading);
    }

    /// Deploying `version` of `component` makes its environment unhealthy
    pub fn mark_bad_version(&self, component: &str, version: &str) {
        self.bad_versions
            .lock()
            .insert((component.to_string(), version.to_string()));
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_splits(&self, fail: bool) {
        self.fail_splits.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn created_envs(&self) -> Vec<(EnvId, EnvironmentSpec)> {
        self.environments
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn deleted_envs(&self) -> Vec<EnvId> {
        self.deleted.lock().clone()
    }

    #[must_use]
    pub fn deployments(&self) -> Vec<Deployment> {
        self.deployments.lock().clone()
    }

    /// Version currently deployed for `component` in `env`
    #[must_use]
    pub fn deployed_version(&self, env: &EnvId, component: &str) -> Option<String> {
        self.deployed
            .lock()
            .get(&(env.clone(), component.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn splits(&self) -> Vec<(String, TrafficSplit)> {
        self.splits.lock().clone()
    }

    #[must_use]
    pub fn last_split(&self, component: &str) -> Option<TrafficSplit> {
        self.splits
            .lock()
            .iter()
            .rev()
            .find(|(c, _)| c == component)
            .map(|(_, s)| s.clone())
    }

    #[must_use]
    pub fn restarts(&self) -> Vec<(EnvId, String)> {
        self.restarts.lock().clone()
    }

    #[must_use]
    pub fn health_check_count(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn env_has_bad_version(&self, env: &EnvId) -> bool {
        let bad = self.bad_versions.lock();
        self.deployed
            .lock()
            .iter()
            .any(|((e, c), v)| e == env && bad.contains(&(c.clone(), v.clone())))
    }
}

fn purpose_prefix(purpose: EnvPurpose) -> &'static str {
    match purpose {
        EnvPurpose::Recovery => "recovery",
        EnvPurpose::Failover => "failover",
        EnvPurpose::Canary => "canary",
    }
}

#[async_trait]
impl DeploymentControlPlane for FakeControlPlane {
    async fn create_environment(&self, spec: &EnvironmentSpec) -> Result<EnvId, DrxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(DrxError::transient("create_environment", "quota exceeded"));
        }
        let n = self.next_env.fetch_add(1, Ordering::SeqCst) + 1;
        let id = EnvId::new(format!("{}-{n}", purpose_prefix(spec.purpose)));
        self.environments.lock().insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn deploy_artifact(
        &self,
        env: &EnvId,
        component: &str,
        version: &str,
    ) -> Result<(), DrxError> {
        self.deployments.lock().push(Deployment {
            env: env.clone(),
            component: component.to_string(),
            version: version.to_string(),
        });
        self.deployed
            .lock()
            .insert((env.clone(), component.to_string()), version.to_string());
        Ok(())
    }

    async fn set_traffic_split(
        &self,
        component: &str,
        split: &TrafficSplit,
    ) -> Result<(), DrxError> {
        if self.fail_splits.load(Ordering::SeqCst) {
            return Err(DrxError::transient("set_traffic_split", "router unavailable"));
        }
        self.splits
            .lock()
            .push((component.to_string(), split.clone()));
        Ok(())
    }

    async fn delete_environment(&self, env: &EnvId) -> Result<(), DrxError> {
        self.environments.lock().remove(env);
        self.deleted.lock().push(env.clone());
        Ok(())
    }

    async fn health_check(&self, env: &EnvId) -> Result<HealthReading, DrxError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .scripted
            .lock()
            .get_mut(env)
            .and_then(VecDeque::pop_front);
        if let Some(result) = scripted {
            return result;
        }
        if self.env_has_bad_version(env) {
            return Ok(HealthReading::new(0.5, 5_000.0));
        }
        Ok(self.defaults.lock().get(env).copied().unwrap_or_else(healthy))
    }

    async fn restart_component(&self, env: &EnvId, component: &str) -> Result<(), DrxError> {
        self.restarts
            .lock()
            .push((env.clone(), component.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Alerter that keeps every alert
#[derive(Debug, Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    #[must_use]
    pub fn count(&self, category: AlertCategory) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.context.category == category)
            .count()
    }

    #[must_use]
    pub fn has(&self, category: AlertCategory) -> bool {
        self.count(category) > 0
    }

    #[must_use]
    pub fn max_severity(&self) -> Option<AlertSeverity> {
        self.alerts.lock().iter().map(|a| a.severity).max()
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn send_alert(&self, severity: AlertSeverity, message: &str, context: AlertContext) {
        self.alerts.lock().push(Alert {
            severity,
            message: message.to_string(),
            context,
            raised_at: Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Every fake and store, shared through `Arc`s
#[derive(Debug, Clone, Default)]
pub struct TestEnv {
    pub store: Arc<MemoryArtifactStore>,
    pub dumper: Arc<FakeDumper>,
    pub control: Arc<FakeControlPlane>,
    pub alerts: Arc<RecordingAlerter>,
    pub manifests: Arc<InMemoryManifestIndex>,
    pub incidents: Arc<InMemoryIncidentTable>,
    pub rollouts: Arc<InMemoryRolloutStore>,
    pub versions: Arc<InMemoryVersionRegistry>,
    pub migrations: Arc<InMemoryMigrationLog>,
}

impl TestEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The fakes as trait objects
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            dumper: self.dumper.clone(),
            control: self.control.clone(),
            alerter: self.alerts.clone(),
        }
    }

    /// The in-memory stores as trait objects
    #[must_use]
    pub fn stores(&self) -> Stores {
        Stores {
            manifests: self.manifests.clone(),
            incidents: self.incidents.clone(),
            rollouts: self.rollouts.clone(),
            versions: self.versions.clone(),
            migrations: self.migrations.clone(),
        }
    }

    /// Upload `bytes` and record a manifest for it, validated or not
    ///
    /// # Panics
    /// If the manifest index rejects the manifest.
    pub async fn seed_manifest(
        &self,
        component: &str,
        tier: Tier,
        at: DateTime<Utc>,
        bytes: &[u8],
        validated: bool,
    ) -> BackupManifest {
        let key = drx_core::backup_key(tier, component, at);
        self.store
            .insert(&key, bytes.to_vec(), tier.default_storage_class());
        let manifest = BackupManifest {
            id: ManifestId::new(),
            job_id: None,
            tier,
            timestamp: at,
            components: [component.to_string()].into_iter().collect(),
            size_bytes: bytes.len() as u64,
            checksum: Checksum::compute(bytes),
            storage_location: key,
            validated_at: validated.then_some(at),
            failure: None,
        };
        self.manifests
            .record(manifest.clone())
            .await
            .expect("seed manifest");
        manifest
    }
}
