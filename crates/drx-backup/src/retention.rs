//! Retention sweeping
//!
//! Manifests are superseded, not deleted, until their tier's retention window
//! passes. The newest validated manifest of each (components, tier) group is
//! always kept so there is a restore point even after a long outage of the
//! scheduler.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use drx_core::store::ManifestIndex;
use drx_core::telemetry::MANIFESTS_EXPIRED_TOTAL;
use drx_core::{ArtifactStore, BackupConfig, BackupManifest, DrxError, ManifestId, Tier};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RetentionSweeper {
    config: Arc<BackupConfig>,
    store: Arc<dyn ArtifactStore>,
    index: Arc<dyn ManifestIndex>,
}

impl RetentionSweeper {
    pub fn new(
        config: Arc<BackupConfig>,
        store: Arc<dyn ArtifactStore>,
        index: Arc<dyn ManifestIndex>,
    ) -> Self {
        Self {
            config,
            store,
            index,
        }
    }

    /// Expire manifests of `tier` older than its retention as of `now`
    ///
    /// Returns the ids that were removed.
    ///
    /// # Errors
    /// The first store or index error; manifests already processed stay
    /// expired.
    pub async fn sweep(&self, tier: Tier, now: DateTime<Utc>) -> Result<Vec<ManifestId>, DrxError> {
        let retention = self.config.policy(tier).retention();
        let horizon = ChronoDuration::from_std(retention)
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let manifests = self.index.list(None, Some(tier)).await?;
        let keep = newest_validated(&manifests);

        let mut expired = Vec::new();
        for manifest in manifests {
            if manifest.timestamp >= horizon || keep.contains(&manifest.id) {
                continue;
            }
            match self.store.delete(&manifest.storage_location).await {
                Ok(()) | Err(DrxError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            self.index.remove(manifest.id).await?;
            debug!(manifest = %manifest.id, key = %manifest.storage_location, "manifest expired");
            expired.push(manifest.id);
        }

        if !expired.is_empty() {
            info!(tier = %tier, count = expired.len(), "retention sweep expired manifests");
            metrics::counter!(MANIFESTS_EXPIRED_TOTAL, "tier" => tier.as_str())
                .increment(expired.len() as u64);
        }
        Ok(expired)
    }
}

fn newest_validated(manifests: &[BackupManifest]) -> BTreeSet<ManifestId> {
    let mut newest: BTreeMap<&BTreeSet<String>, &BackupManifest> = BTreeMap::new();
    for manifest in manifests.iter().filter(|m| m.is_restorable()) {
        newest
            .entry(&manifest.components)
            .and_modify(|current| {
                if manifest.timestamp > current.timestamp {
                    *current = manifest;
                }
            })
            .or_insert(manifest);
    }
    newest.values().map(|m| m.id).collect()
}
