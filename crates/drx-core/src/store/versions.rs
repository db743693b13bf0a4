//! Component version registry
//!
//! Append-only history of deployments per component. The deployment pipeline
//! records every release; the rollback manager reads it and appends a new
//! record on successful rollback.

use crate::error::DrxError;
use crate::types::ComponentVersionRecord;
use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait VersionRegistry: Send + Sync {
    /// Append a deployment record
    async fn record(&self, record: ComponentVersionRecord) -> Result<(), DrxError>;

    /// Latest record for `component`
    async fn current(&self, component: &str) -> Result<Option<ComponentVersionRecord>, DrxError>;

    /// All records for `component`, oldest first
    async fn history(&self, component: &str) -> Result<Vec<ComponentVersionRecord>, DrxError>;

    /// Most recent record that deployed `version`
    async fn find(
        &self,
        component: &str,
        version: &str,
    ) -> Result<Option<ComponentVersionRecord>, DrxError> {
        Ok(self
            .history(component)
            .await?
            .into_iter()
            .rev()
            .find(|r| r.current_version == version))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryVersionRegistry {
    inner: DashMap<String, Vec<ComponentVersionRecord>>,
}

impl InMemoryVersionRegistry {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionRegistry for InMemoryVersionRegistry {
    async fn record(&self, record: ComponentVersionRecord) -> Result<(), DrxError> {
        self.inner
            .entry(record.component_name.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn current(&self, component: &str) -> Result<Option<ComponentVersionRecord>, DrxError> {
        Ok(self
            .inner
            .get(component)
            .and_then(|records| records.last().cloned()))
    }

    async fn history(&self, component: &str) -> Result<Vec<ComponentVersionRecord>, DrxError> {
        Ok(self
            .inner
            .get(component)
            .map(|records| records.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn history_is_append_only() {
        let registry = InMemoryVersionRegistry::new();
        registry
            .record(ComponentVersionRecord::new("api", "1.0.0", Utc::now()))
            .await
            .unwrap();
        registry
            .record(ComponentVersionRecord::new("api", "1.1.0", Utc::now()).with_rollback_target("1.0.0"))
            .await
            .unwrap();

        let current = registry.current("api").await.unwrap().unwrap();
        assert_eq!(current.current_version, "1.1.0");
        assert_eq!(current.rollback_target.as_deref(), Some("1.0.0"));
        assert_eq!(registry.history("api").await.unwrap().len(), 2);
        assert!(registry.find("api", "1.0.0").await.unwrap().is_some());
        assert!(registry.find("api", "9.9.9").await.unwrap().is_none());
        assert!(registry.current("missing").await.unwrap().is_none());
    }
}
