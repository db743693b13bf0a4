//! Rollout state store
//!
//! One authoritative record per component. Writers read the record, mutate a
//! copy and write it back with [`RolloutStore::compare_and_swap`], so two
//! controller instances can never both advance the same rollout.

use crate::error::DrxError;
use crate::types::RolloutState;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Authoritative per-component rollout state
#[async_trait]
pub trait RolloutStore: Send + Sync {
    /// Register a new rollout
    ///
    /// # Errors
    /// `ConcurrencyViolation` if the component has a progressing rollout.
    async fn begin(&self, state: RolloutState) -> Result<RolloutState, DrxError>;

    async fn get(&self, component: &str) -> Result<Option<RolloutState>, DrxError>;

    /// Conditional replace keyed on `revision`
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: RolloutState,
    ) -> Result<RolloutState, DrxError>;

    async fn list(&self) -> Result<Vec<RolloutState>, DrxError>;
}

/// Rollout store held in memory
#[derive(Debug, Default)]
pub struct InMemoryRolloutStore {
    inner: DashMap<String, RolloutState>,
}

impl InMemoryRolloutStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RolloutStore for InMemoryRolloutStore {
    async fn begin(&self, mut state: RolloutState) -> Result<RolloutState, DrxError> {
        match self.inner.entry(state.component_name.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_active() {
                    return Err(DrxError::ConcurrencyViolation(format!(
                        "rollout for {} already progressing",
                        state.component_name
                    )));
                }
                // Carry the revert history across rollouts of the same component.
                state.revert_count = existing.get().revert_count;
                state.revision = existing.get().revision + 1;
                existing.insert(state.clone());
            }
            Entry::Vacant(slot) => {
                state.revision = 1;
                slot.insert(state.clone());
            }
        }
        Ok(state)
    }

    async fn get(&self, component: &str) -> Result<Option<RolloutState>, DrxError> {
        Ok(self.inner.get(component).map(|r| r.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        mut next: RolloutState,
    ) -> Result<RolloutState, DrxError> {
        let mut entry = self
            .inner
            .get_mut(&next.component_name)
            .ok_or_else(|| DrxError::NotFound(format!("rollout {}", next.component_name)))?;
        let found = entry.revision;
        if found != expected_revision {
            return Err(DrxError::StaleRevision {
                expected: expected_revision,
                found,
            });
        }
        next.revision = found + 1;
        *entry = next.clone();
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<RolloutState>, DrxError> {
        let mut all: Vec<_> = self.inner.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.component_name.cmp(&b.component_name));
        Ok(all)
    }
}
