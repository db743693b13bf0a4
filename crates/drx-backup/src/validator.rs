//! Backup validation
//!
//! Downloads an uploaded artifact, recomputes its checksum and, for
//! structured dumps, runs a structure sanity pass before recording the
//! manifest. Only a fully verified artifact gets `validated_at`.

use chrono::Utc;
use drx_core::store::ManifestIndex;
use drx_core::telemetry::BACKUP_VALIDATIONS_TOTAL;
use drx_core::{
    retry_with_backoff, AlertCategory, AlertContext, AlertSeverity, Alerter, ArtifactStore,
    BackupConfig, BackupJob, BackupManifest, Checksum, DrxError, DumpFormat, JobStatus,
    ManifestId, ValidationError, ValidationFailure,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Turns uploaded jobs into manifests
#[derive(Clone)]
pub struct BackupValidator {
    config: Arc<BackupConfig>,
    store: Arc<dyn ArtifactStore>,
    index: Arc<dyn ManifestIndex>,
    alerter: Arc<dyn Alerter>,
}

impl BackupValidator {
    pub fn new(
        config: Arc<BackupConfig>,
        store: Arc<dyn ArtifactStore>,
        index: Arc<dyn ManifestIndex>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            config,
            store,
            index,
            alerter,
        }
    }

    /// Verify an uploaded job and record its manifest
    ///
    /// A missing artifact records nothing. A corrupt artifact is still
    /// recorded, with `validated_at` unset and the failure attached, so it is
    /// visible but never chosen as a restore point.
    ///
    /// # Errors
    /// `DrxError::Validation` describing why the artifact is not usable, or
    /// the store error if the download itself kept failing.
    #[instrument(skip(self, job), fields(job = %job.id, tier = %job.tier, component = %job.component))]
    pub async fn validate(&self, job: &BackupJob) -> Result<BackupManifest, DrxError> {
        let (key, expected) = match (&job.storage_key, job.checksum, job.status) {
            (Some(key), Some(checksum), JobStatus::Uploaded) => (key.as_str(), checksum),
            _ => return Err(ValidationError::NotUploaded(job.id.to_string()).into()),
        };

        let store = &self.store;
        let download = retry_with_backoff(
            &self.config.retry,
            "download",
            self.config.operation_timeout(),
            move |_| async move { store.get(key).await },
        )
        .await;

        let bytes = match download.into_result() {
            Ok(bytes) => bytes,
            Err(DrxError::NotFound(_)) => {
                let err = ValidationError::Missing {
                    key: key.to_string(),
                };
                self.report(job, "missing", &err).await;
                return Err(err.into());
            }
            Err(err) => {
                error!(error = %err, "artifact download failed");
                metrics::counter!(BACKUP_VALIDATIONS_TOTAL, "tier" => job.tier.as_str(), "outcome" => "error")
                    .increment(1);
                let context = AlertContext::new(AlertCategory::RetriesExhausted)
                    .with_component(job.component.clone())
                    .with("tier", job.tier)
                    .with("job", job.id)
                    .with("key", key);
                self.alerter
                    .send_alert(
                        AlertSeverity::Critical,
                        &format!("backup {key} could not be downloaded for validation: {err}"),
                        context,
                    )
                    .await;
                return Err(err);
            }
        };

        let actual = Checksum::compute(&bytes);
        let failure = if actual != expected {
            Some(ValidationFailure::ChecksumMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        } else {
            check_structure(self.config.format_of(&job.component), &bytes)
                .err()
                .map(|reason| ValidationFailure::Malformed { reason })
        };

        let now = Utc::now();
        let manifest = BackupManifest {
            id: ManifestId::new(),
            job_id: Some(job.id),
            tier: job.tier,
            timestamp: job.scheduled_at,
            components: [job.component.clone()].into_iter().collect(),
            size_bytes: bytes.len() as u64,
            checksum: expected,
            storage_location: key.to_string(),
            validated_at: failure.is_none().then_some(now),
            failure: failure.clone(),
        };
        self.index.record(manifest.clone()).await?;

        match failure {
            None => {
                info!(manifest = %manifest.id, size_bytes = manifest.size_bytes, "backup validated");
                metrics::counter!(BACKUP_VALIDATIONS_TOTAL, "tier" => job.tier.as_str(), "outcome" => "validated")
                    .increment(1);
                Ok(manifest)
            }
            Some(ValidationFailure::ChecksumMismatch { expected, actual }) => {
                let err = ValidationError::ChecksumMismatch {
                    key: key.to_string(),
                    expected,
                    actual,
                };
                self.report(job, "corrupt", &err).await;
                Err(err.into())
            }
            Some(ValidationFailure::Malformed { reason }) => {
                let err = ValidationError::Malformed {
                    key: key.to_string(),
                    reason,
                };
                self.report(job, "corrupt", &err).await;
                Err(err.into())
            }
        }
    }

    async fn report(&self, job: &BackupJob, outcome: &'static str, err: &ValidationError) {
        warn!(error = %err, outcome, "backup failed validation");
        metrics::counter!(BACKUP_VALIDATIONS_TOTAL, "tier" => job.tier.as_str(), "outcome" => outcome)
            .increment(1);

        let category = if err.is_corrupt() {
            AlertCategory::Validation
        } else {
            AlertCategory::BackupMissing
        };
        let context = AlertContext::new(category)
            .with_component(job.component.clone())
            .with("tier", job.tier)
            .with("job", job.id);
        self.alerter
            .send_alert(AlertSeverity::Critical, &err.to_string(), context)
            .await;
    }
}

/// Structure sanity pass for a dump of the given format
///
/// # Errors
/// A human-readable reason when the dump does not look like its format.
pub fn check_structure(format: DumpFormat, bytes: &[u8]) -> Result<(), String> {
    match format {
        DumpFormat::Opaque => Ok(()),
        DumpFormat::Json => serde_json::from_slice::<serde_json::Value>(bytes)
            .map(|_| ())
            .map_err(|e| format!("invalid JSON: {e}")),
        DumpFormat::Sql => check_sql(bytes),
    }
}

static SQL_STATEMENT: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(CREATE|INSERT|ALTER|DROP|COPY|SET|BEGIN|COMMIT|UPDATE|DELETE|SELECT)\b")
});

fn check_sql(bytes: &[u8]) -> Result<(), String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("SQL dump is not UTF-8: {e}"))?;
    let body: String = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    let statement = SQL_STATEMENT.as_ref().map_err(|e| e.to_string())?;
    if !statement.is_match(&body) {
        return Err("no SQL statements found".to_string());
    }
    if body.chars().filter(|c| *c == '\'').count() % 2 != 0 {
        return Err("unbalanced string literal".to_string());
    }
    if !body.trim_end().ends_with(';') {
        return Err("last statement is not terminated".to_string());
    }
    Ok(())
}
