//! Incident table
//!
//! Enforces "at most one open incident" with a conditional write on a
//! singleton active slot, and versions every incident with a revision counter
//! so controller instances coordinate through compare-and-swap instead of
//! process-local locks.

use crate::error::DrxError;
use crate::types::{DrIncident, IncidentId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Transactional store of DR incidents
#[async_trait]
pub trait IncidentTable: Send + Sync {
    /// Insert `incident` as the active incident
    ///
    /// # Errors
    /// `ConcurrencyViolation` if another incident is open.
    async fn open(&self, incident: DrIncident) -> Result<DrIncident, DrxError>;

    async fn get(&self, id: IncidentId) -> Result<Option<DrIncident>, DrxError>;

    /// The incident holding the active slot, if any
    async fn active(&self) -> Result<Option<DrIncident>, DrxError>;

    /// Replace the stored incident if its revision still equals
    /// `expected_revision`; returns the stored copy with the bumped revision.
    /// Resolving the incident releases the active slot.
    ///
    /// # Errors
    /// `StaleRevision` if another writer got there first, `NotFound` if the
    /// incident does not exist.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: DrIncident,
    ) -> Result<DrIncident, DrxError>;

    /// Every incident ever opened, oldest first
    async fn history(&self) -> Result<Vec<DrIncident>, DrxError>;
}

#[derive(Debug, Default)]
struct TableState {
    active: Option<IncidentId>,
    incidents: BTreeMap<IncidentId, DrIncident>,
}

/// Incident table held in memory
#[derive(Debug, Default)]
pub struct InMemoryIncidentTable {
    inner: Mutex<TableState>,
}

impl InMemoryIncidentTable {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IncidentTable for InMemoryIncidentTable {
    async fn open(&self, mut incident: DrIncident) -> Result<DrIncident, DrxError> {
        let mut state = self.inner.lock();
        if let Some(active) = state.active {
            return Err(DrxError::ConcurrencyViolation(format!(
                "incident {active} is already active"
            )));
        }
        incident.revision = 1;
        state.active = Some(incident.id);
        state.incidents.insert(incident.id, incident.clone());
        Ok(incident)
    }

    async fn get(&self, id: IncidentId) -> Result<Option<DrIncident>, DrxError> {
        Ok(self.inner.lock().incidents.get(&id).cloned())
    }

    async fn active(&self) -> Result<Option<DrIncident>, DrxError> {
        let state = self.inner.lock();
        Ok(state
            .active
            .and_then(|id| state.incidents.get(&id))
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        mut next: DrIncident,
    ) -> Result<DrIncident, DrxError> {
        let mut state = self.inner.lock();
        let found = state
            .incidents
            .get(&next.id)
            .map(|i| i.revision)
            .ok_or_else(|| DrxError::NotFound(format!("incident {}", next.id)))?;
        if found != expected_revision {
            return Err(DrxError::StaleRevision {
                expected: expected_revision,
                found,
            });
        }

        next.revision = found + 1;
        if !next.is_open() && state.active == Some(next.id) {
            state.active = None;
        }
        state.incidents.insert(next.id, next.clone());
        Ok(next)
    }

    async fn history(&self) -> Result<Vec<DrIncident>, DrxError> {
        let state = self.inner.lock();
        let mut all: Vec<_> = state.incidents.values().cloned().collect();
        all.sort_by_key(|i| (i.opened_at, i.id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DrLevel, IncidentTrigger, TriggerSource};
    use chrono::Utc;
    use std::sync::Arc;

    fn incident(level: DrLevel) -> DrIncident {
        DrIncident::open(
            IncidentTrigger::new(vec!["api".into()], "test", TriggerSource::Monitoring, level),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn second_open_is_rejected() {
        let table = InMemoryIncidentTable::new();
        table.open(incident(DrLevel::ServiceDegradation)).await.unwrap();

        let err = table
            .open(incident(DrLevel::Catastrophic))
            .await
            .unwrap_err();
        assert!(matches!(err, DrxError::ConcurrencyViolation(_)));
        assert_eq!(table.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolve_releases_slot() {
        let table = InMemoryIncidentTable::new();
        let mut stored = table.open(incident(DrLevel::ServiceOutage)).await.unwrap();
        let rev = stored.revision;
        stored.resolve("oncall", Utc::now());
        table.compare_and_swap(rev, stored).await.unwrap();

        assert!(table.active().await.unwrap().is_none());
        assert!(table.open(incident(DrLevel::ServiceDegradation)).await.is_ok());
    }

    #[tokio::test]
    async fn stale_write_is_rejected() {
        let table = InMemoryIncidentTable::new();
        let stored = table.open(incident(DrLevel::ServiceDegradation)).await.unwrap();

        let mut a = stored.clone();
        a.escalate_to(DrLevel::ServiceOutage, "a", Utc::now()).unwrap();
        let mut b = stored.clone();
        b.annotations.push("b".into());

        table.compare_and_swap(stored.revision, a).await.unwrap();
        let err = table.compare_and_swap(stored.revision, b).await.unwrap_err();
        assert!(matches!(err, DrxError::StaleRevision { .. }));

        let current = table.active().await.unwrap().unwrap();
        assert_eq!(current.level, DrLevel::ServiceOutage);
        assert!(current.annotations.is_empty());
    }

    #[tokio::test]
    async fn concurrent_opens_admit_exactly_one() {
        let table = Arc::new(InMemoryIncidentTable::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let t = table.clone();
            handles.push(tokio::spawn(async move {
                t.open(incident(DrLevel::ServiceDegradation)).await.is_ok()
            }));
        }
        let mut opened = 0;
        for h in handles {
            if h.await.unwrap() {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
    }
}
