//! Tiered backup scheduler
//!
//! One long-lived task per tier fires on the tier's cadence. Each firing
//! backs up every configured target concurrently: dump, upload under
//! `{tier}/{component}/{timestamp}` with the tier's storage class, then hand
//! the job to the validator. A firing for a (component, tier) pair whose
//! previous job is still running is skipped, never queued.

use crate::retention::RetentionSweeper;
use crate::validator::BackupValidator;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use drx_core::store::ManifestIndex;
use drx_core::telemetry::BACKUP_JOBS_TOTAL;
use drx_core::{
    backup_key, retry_with_backoff, with_timeout, AlertCategory, AlertContext, AlertSeverity,
    Alerter, ArtifactStore, BackupConfig, BackupJob, Checksum, DataDumper, DrxError, DumpTarget,
    JobId, Tier,
};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

type SlotMap = DashMap<(String, Tier), JobId>;

/// Releases a (component, tier) slot when the job finishes
struct SlotGuard {
    slots: Arc<SlotMap>,
    key: (String, Tier),
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.remove(&self.key);
    }
}

/// Produces backup jobs per tier
#[derive(Clone)]
pub struct BackupScheduler {
    config: Arc<BackupConfig>,
    dumper: Arc<dyn DataDumper>,
    store: Arc<dyn ArtifactStore>,
    alerter: Arc<dyn Alerter>,
    validator: BackupValidator,
    sweeper: RetentionSweeper,
    in_flight: Arc<SlotMap>,
}

impl BackupScheduler {
    pub fn new(
        config: BackupConfig,
        dumper: Arc<dyn DataDumper>,
        store: Arc<dyn ArtifactStore>,
        index: Arc<dyn ManifestIndex>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        let config = Arc::new(config);
        let validator = BackupValidator::new(
            config.clone(),
            store.clone(),
            index.clone(),
            alerter.clone(),
        );
        let sweeper = RetentionSweeper::new(config.clone(), store.clone(), index);
        Self {
            config,
            dumper,
            store,
            alerter,
            validator,
            sweeper,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    #[must_use]
    pub fn validator(&self) -> &BackupValidator {
        &self.validator
    }

    /// Whether a job for the pair currently holds its slot
    #[must_use]
    pub fn is_running(&self, component: &str, tier: Tier) -> bool {
        self.in_flight.contains_key(&(component.to_string(), tier))
    }

    fn claim(&self, component: &str, tier: Tier, job: JobId) -> Result<SlotGuard, DrxError> {
        let key = (component.to_string(), tier);
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(running) => Err(DrxError::ConcurrencyViolation(format!(
                "{tier} backup of {component} still running as job {}",
                running.get()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(job);
                Ok(SlotGuard {
                    slots: self.in_flight.clone(),
                    key,
                })
            }
        }
    }

    /// Back up one component for one tier
    ///
    /// Returns the finished job (uploaded and validated, or failed). Exhausted
    /// retries alert but never escalate to DR.
    ///
    /// # Errors
    /// `ConcurrencyViolation` when the pair already has a running job; the
    /// firing is skipped.
    pub async fn run_job(&self, tier: Tier, component: &str) -> Result<BackupJob, DrxError> {
        self.execute(tier, component, None).await
    }

    /// [`Self::run_job`], sending each state change of the job to `events`
    #[instrument(skip(self, tier, events), fields(tier = %tier))]
    async fn execute(
        &self,
        tier: Tier,
        component: &str,
        events: Option<&mpsc::Sender<BackupJob>>,
    ) -> Result<BackupJob, DrxError> {
        let mut job = BackupJob::new(tier, component, Utc::now());
        let _slot = match self.claim(component, tier, job.id) {
            Ok(slot) => slot,
            Err(err) => {
                warn!(error = %err, "skipping backup firing");
                metrics::counter!(BACKUP_JOBS_TOTAL, "tier" => tier.as_str(), "outcome" => "skipped")
                    .increment(1);
                return Err(err);
            }
        };
        job.mark_running();
        info!(job = %job.id, "backup job running");
        emit(events, &job).await;

        let policy = self.config.policy(tier);
        let key = backup_key(tier, component, job.scheduled_at);
        let target = DumpTarget::primary(component);
        let op_timeout = self.config.operation_timeout();

        let (dumper, store, key_ref, target_ref) = (&self.dumper, &self.store, key.as_str(), &target);
        let outcome = retry_with_backoff(
            &self.config.retry,
            "backup",
            op_timeout * 2,
            move |_| async move {
                let bytes = with_timeout("dump", op_timeout, dumper.dump(target_ref)).await?;
                let checksum = Checksum::compute(&bytes);
                let size = bytes.len() as u64;
                with_timeout(
                    "upload",
                    op_timeout,
                    store.put(key_ref, bytes, policy.storage_class),
                )
                .await?;
                Ok::<_, DrxError>((checksum, size))
            },
        )
        .await;
        job.attempts = outcome.attempts;

        match outcome.result {
            Ok((checksum, size)) => {
                job.mark_uploaded(key, checksum, size);
                info!(job = %job.id, size_bytes = size, attempts = job.attempts, "backup uploaded");
                metrics::counter!(BACKUP_JOBS_TOTAL, "tier" => tier.as_str(), "outcome" => "uploaded")
                    .increment(1);
                job.validated = self.validator.validate(&job).await.is_ok();
            }
            Err(err) => {
                job.mark_failed(err.to_string());
                error!(job = %job.id, attempts = job.attempts, error = %err, "backup job failed");
                metrics::counter!(BACKUP_JOBS_TOTAL, "tier" => tier.as_str(), "outcome" => "failed")
                    .increment(1);
                let category = if err.is_retryable() {
                    AlertCategory::RetriesExhausted
                } else {
                    err.alert_category()
                };
                let context = AlertContext::new(category)
                    .with_component(component)
                    .with("tier", tier)
                    .with("attempts", job.attempts);
                self.alerter
                    .send_alert(
                        AlertSeverity::Critical,
                        &format!("{tier} backup of {component} failed: {err}"),
                        context,
                    )
                    .await;
            }
        }
        emit(events, &job).await;
        Ok(job)
    }

    /// Fire one round of `tier` for every configured target, then sweep
    ///
    /// Skipped pairs are left out of the result.
    pub async fn run_once(&self, tier: Tier) -> Vec<BackupJob> {
        self.run_round(tier, None).await
    }

    async fn run_round(
        &self,
        tier: Tier,
        events: Option<&mpsc::Sender<BackupJob>>,
    ) -> Vec<BackupJob> {
        let runs = self
            .config
            .targets
            .iter()
            .map(|target| self.execute(tier, &target.component, events));
        let jobs: Vec<BackupJob> = join_all(runs).await.into_iter().flatten().collect();

        if let Err(err) = self.sweeper.sweep(tier, Utc::now()).await {
            warn!(tier = %tier, error = %err, "retention sweep failed");
        }
        jobs
    }

    /// Start the long-lived task for `tier`
    ///
    /// Every job state change is sent on the returned channel: `running`
    /// when a job claims its slot, then `uploaded` or `failed`. Each firing runs on its
    /// own task so a slow round never delays the cadence; overlapping pairs
    /// are skipped by the slot guard. The loop exits when `cancel` fires.
    pub fn schedule_tier(
        &self,
        tier: Tier,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, mpsc::Receiver<BackupJob>) {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let cadence = self.config.policy(tier).cadence();

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(cadence);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("backup tier loop stopped");
                            break;
                        }
                        _ = ticker.tick() => {
                            let round = this.clone();
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                round.run_round(tier, Some(&tx)).await;
                            }.in_current_span());
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("backup_tier", tier = %tier)),
        );
        (handle, rx)
    }

    /// Start one loop per tier sharing the same cancellation token
    pub fn schedule_all(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<(Tier, JoinHandle<()>, mpsc::Receiver<BackupJob>)> {
        Tier::ALL
            .iter()
            .map(|tier| {
                let (handle, rx) = self.schedule_tier(*tier, cancel.child_token());
                (*tier, handle, rx)
            })
            .collect()
    }
}

async fn emit(events: Option<&mpsc::Sender<BackupJob>>, job: &BackupJob) {
    if let Some(tx) = events {
        if tx.send(job.clone()).await.is_err() {
            debug!(job = %job.id, "job event receiver closed");
        }
    }
}
