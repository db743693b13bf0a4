//! Migration log
//!
//! Append-only audit trail of work phases per component. At most one entry
//! per (component, phase) may be open at a time.

use crate::error::DrxError;
use crate::types::{MigrationLogEntry, MigrationStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

#[async_trait]
pub trait MigrationLog: Send + Sync {
    /// Open a `started` entry
    ///
    /// # Errors
    /// `ConcurrencyViolation` if the (component, phase) pair already has an
    /// open entry.
    async fn start(&self, component: &str, phase: &str) -> Result<MigrationLogEntry, DrxError>;

    /// Close the open entry as `completed`
    async fn complete(&self, component: &str, phase: &str)
        -> Result<MigrationLogEntry, DrxError>;

    /// Close the open entry as `failed`
    async fn fail(
        &self,
        component: &str,
        phase: &str,
        error: &str,
    ) -> Result<MigrationLogEntry, DrxError>;

    async fn entries(&self) -> Result<Vec<MigrationLogEntry>, DrxError>;
}

#[derive(Debug, Default)]
pub struct InMemoryMigrationLog {
    inner: Mutex<Vec<MigrationLogEntry>>,
}

impl InMemoryMigrationLog {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn close(
        &self,
        component: &str,
        phase: &str,
        status: MigrationStatus,
        error: Option<&str>,
    ) -> Result<MigrationLogEntry, DrxError> {
        let mut entries = self.inner.lock();
        let entry = entries
            .iter_mut()
            .rev()
            .find(|e| e.is_open() && e.component == component && e.phase == phase)
            .ok_or_else(|| DrxError::NotFound(format!("open migration {component}/{phase}")))?;

        let now = Utc::now();
        entry.status = status;
        entry.completed_at = Some(now);
        entry.duration_ms = u64::try_from((now - entry.started_at).num_milliseconds()).ok();
        entry.error = error.map(str::to_string);
        Ok(entry.clone())
    }
}

#[async_trait]
impl MigrationLog for InMemoryMigrationLog {
    async fn start(&self, component: &str, phase: &str) -> Result<MigrationLogEntry, DrxError> {
        let mut entries = self.inner.lock();
        if entries
            .iter()
            .any(|e| e.is_open() && e.component == component && e.phase == phase)
        {
            return Err(DrxError::ConcurrencyViolation(format!(
                "{component}/{phase} already started"
            )));
        }
        let entry = MigrationLogEntry {
            component: component.to_string(),
            phase: phase.to_string(),
            status: MigrationStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error: None,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn complete(
        &self,
        component: &str,
        phase: &str,
    ) -> Result<MigrationLogEntry, DrxError> {
        self.close(component, phase, MigrationStatus::Completed, None)
    }

    async fn fail(
        &self,
        component: &str,
        phase: &str,
        error: &str,
    ) -> Result<MigrationLogEntry, DrxError> {
        self.close(component, phase, MigrationStatus::Failed, Some(error))
    }

    async fn entries(&self) -> Result<Vec<MigrationLogEntry>, DrxError> {
        Ok(self.inner.lock().clone())
    }
}
