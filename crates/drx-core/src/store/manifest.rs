//! Manifest index
//!
//! Single source of truth for which backups exist and which are restorable.
//! Validated manifests are immutable: re-recording one under the same id with
//! different content is rejected.

use crate::error::DrxError;
use crate::types::{BackupManifest, ManifestId, Tier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persistent index of backup manifests
#[async_trait]
pub trait ManifestIndex: Send + Sync {
    /// Insert or replace an unvalidated manifest
    async fn record(&self, manifest: BackupManifest) -> Result<(), DrxError>;

    async fn get(&self, id: ManifestId) -> Result<Option<BackupManifest>, DrxError>;

    /// Manifests matching the filters, oldest first
    async fn list(
        &self,
        component: Option<&str>,
        tier: Option<Tier>,
    ) -> Result<Vec<BackupManifest>, DrxError>;

    /// Drop a manifest after retention expiry
    async fn remove(&self, id: ManifestId) -> Result<(), DrxError>;

    /// Newest validated manifest covering `component`
    async fn latest_restorable(
        &self,
        component: &str,
        tier: Option<Tier>,
    ) -> Result<Option<BackupManifest>, DrxError> {
        Ok(self
            .list(Some(component), tier)
            .await?
            .into_iter()
            .filter(BackupManifest::is_restorable)
            .max_by_key(|m| m.timestamp))
    }

    /// Newest validated manifest taken at or before `point`
    async fn restorable_at_or_before(
        &self,
        component: &str,
        point: DateTime<Utc>,
    ) -> Result<Option<BackupManifest>, DrxError> {
        Ok(self
            .list(Some(component), None)
            .await?
            .into_iter()
            .filter(|m| m.is_restorable() && m.timestamp <= point)
            .max_by_key(|m| m.timestamp))
    }
}

fn check_immutable(
    existing: Option<&BackupManifest>,
    incoming: &BackupManifest,
) -> Result<(), DrxError> {
    match existing {
        Some(current) if current.is_restorable() && current != incoming => {
            Err(DrxError::ConcurrencyViolation(format!(
                "manifest {} is validated and immutable",
                incoming.id
            )))
        }
        _ => Ok(()),
    }
}

fn filtered(
    manifests: impl Iterator<Item = BackupManifest>,
    component: Option<&str>,
    tier: Option<Tier>,
) -> Vec<BackupManifest> {
    let mut out: Vec<_> = manifests
        .filter(|m| component.map_or(true, |c| m.includes(c)))
        .filter(|m| tier.map_or(true, |t| m.tier == t))
        .collect();
    out.sort_by_key(|m| (m.timestamp, m.id));
    out
}

/// Manifest index held in memory
#[derive(Debug, Default)]
pub struct InMemoryManifestIndex {
    inner: RwLock<BTreeMap<ManifestId, BackupManifest>>,
}

impl InMemoryManifestIndex {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl ManifestIndex for InMemoryManifestIndex {
    async fn record(&self, manifest: BackupManifest) -> Result<(), DrxError> {
        let mut guard = self.inner.write();
        check_immutable(guard.get(&manifest.id), &manifest)?;
        guard.insert(manifest.id, manifest);
        Ok(())
    }

    async fn get(&self, id: ManifestId) -> Result<Option<BackupManifest>, DrxError> {
        Ok(self.inner.read().get(&id).cloned())
    }

    async fn list(
        &self,
        component: Option<&str>,
        tier: Option<Tier>,
    ) -> Result<Vec<BackupManifest>, DrxError> {
        let guard = self.inner.read();
        Ok(filtered(guard.values().cloned(), component, tier))
    }

    async fn remove(&self, id: ManifestId) -> Result<(), DrxError> {
        self.inner.write().remove(&id);
        Ok(())
    }
}

/// Manifest index persisted as one JSON file per manifest
///
/// Writes go to a temp file in the same directory and are renamed into place,
/// so a crash never leaves a half-written manifest.
#[derive(Debug)]
pub struct FileManifestIndex {
    dir: PathBuf,
    cache: RwLock<BTreeMap<ManifestId, BackupManifest>>,
}

impl FileManifestIndex {
    /// Open (or create) an index rooted at `dir`, loading existing manifests
    ///
    /// # Errors
    /// `DrxError::Storage` if the directory cannot be read, or
    /// `DrxError::Serialization` if a manifest file is corrupt.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, DrxError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut cache = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let manifest: BackupManifest = serde_json::from_slice(&bytes)?;
            cache.insert(manifest.id, manifest);
        }
        tracing::debug!(dir = %dir.display(), manifests = cache.len(), "opened manifest index");

        Ok(Self {
            dir,
            cache: RwLock::new(cache),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: ManifestId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write_atomic(&self, manifest: &BackupManifest) -> Result<(), DrxError> {
        let json = serde_json::to_vec_pretty(manifest)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(manifest.id))
            .map_err(|e| DrxError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ManifestIndex for FileManifestIndex {
    async fn record(&self, manifest: BackupManifest) -> Result<(), DrxError> {
        let mut guard = self.cache.write();
        check_immutable(guard.get(&manifest.id), &manifest)?;
        self.write_atomic(&manifest)?;
        guard.insert(manifest.id, manifest);
        Ok(())
    }

    async fn get(&self, id: ManifestId) -> Result<Option<BackupManifest>, DrxError> {
        Ok(self.cache.read().get(&id).cloned())
    }

    async fn list(
        &self,
        component: Option<&str>,
        tier: Option<Tier>,
    ) -> Result<Vec<BackupManifest>, DrxError> {
        let guard = self.cache.read();
        Ok(filtered(guard.values().cloned(), component, tier))
    }

    async fn remove(&self, id: ManifestId) -> Result<(), DrxError> {
        let mut guard = self.cache.write();
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        guard.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn manifest(component: &str, tier: Tier, minutes: i64, validated: bool) -> BackupManifest {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes);
        BackupManifest {
            id: ManifestId::new(),
            job_id: None,
            tier,
            timestamp: ts,
            components: [component.to_string()].into_iter().collect(),
            size_bytes: 4,
            checksum: Checksum::compute(b"data"),
            storage_location: format!("{tier}/{component}/{minutes}"),
            validated_at: validated.then_some(ts),
            failure: None,
        }
    }

    #[tokio::test]
    async fn latest_restorable_skips_unvalidated() {
        let index = InMemoryManifestIndex::new();
        let old = manifest("database", Tier::Hot, 0, true);
        let newer_corrupt = manifest("database", Tier::Hot, 60, false);
        index.record(old.clone()).await.unwrap();
        index.record(newer_corrupt).await.unwrap();

        let picked = index.latest_restorable("database", None).await.unwrap();
        assert_eq!(picked.map(|m| m.id), Some(old.id));
    }

    #[tokio::test]
    async fn point_in_time_selection() {
        let index = InMemoryManifestIndex::new();
        let a = manifest("database", Tier::Hot, 0, true);
        let b = manifest("database", Tier::Warm, 120, true);
        index.record(a.clone()).await.unwrap();
        index.record(b.clone()).await.unwrap();

        let point = a.timestamp + Duration::minutes(60);
        let picked = index.restorable_at_or_before("database", point).await.unwrap();
        assert_eq!(picked.map(|m| m.id), Some(a.id));

        let none = index
            .restorable_at_or_before("database", a.timestamp - Duration::minutes(1))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn validated_manifest_is_immutable() {
        let index = InMemoryManifestIndex::new();
        let m = manifest("config", Tier::Warm, 0, true);
        index.record(m.clone()).await.unwrap();

        let mut changed = m.clone();
        changed.size_bytes = 99;
        assert!(matches!(
            index.record(changed).await,
            Err(DrxError::ConcurrencyViolation(_))
        ));
        assert!(index.record(m).await.is_ok());
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let index = InMemoryManifestIndex::new();
        index.record(manifest("a", Tier::Hot, 30, true)).await.unwrap();
        index.record(manifest("a", Tier::Hot, 10, true)).await.unwrap();
        index.record(manifest("a", Tier::Geo, 20, true)).await.unwrap();
        index.record(manifest("b", Tier::Hot, 5, true)).await.unwrap();

        let hot_a = index.list(Some("a"), Some(Tier::Hot)).await.unwrap();
        assert_eq!(hot_a.len(), 2);
        assert!(hot_a[0].timestamp < hot_a[1].timestamp);
        assert_eq!(index.list(None, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn file_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest("database", Tier::Geo, 0, true);
        {
            let index = FileManifestIndex::open(dir.path()).unwrap();
            index.record(m.clone()).await.unwrap();
        }

        let reopened = FileManifestIndex::open(dir.path()).unwrap();
        assert_eq!(reopened.get(m.id).await.unwrap(), Some(m.clone()));

        reopened.remove(m.id).await.unwrap();
        let again = FileManifestIndex::open(dir.path()).unwrap();
        assert!(again.get(m.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_index_writes_spec_fields() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileManifestIndex::open(dir.path()).unwrap();
        let m = manifest("database", Tier::Hot, 0, false);
        index.record(m.clone()).await.unwrap();

        let raw = std::fs::read(dir.path().join(format!("{}.json", m.id))).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        for field in [
            "id",
            "tier",
            "timestamp",
            "components",
            "sizeBytes",
            "checksum",
            "storageLocation",
            "validatedAt",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert!(json["validatedAt"].is_null());
    }
}
