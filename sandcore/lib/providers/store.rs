use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    models::{Sandbox, SandboxStatus},
    SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Persistent sandbox records.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Inserts a new record.
    async fn create(&self, sandbox: &Sandbox) -> SandcoreResult<()>;

    /// Fetches a record.
    async fn get(&self, id: &str) -> SandcoreResult<Option<Sandbox>>;

    /// Overwrites a record, refreshing `updated_at`. Returns the stored value, or `None` when
    /// the record does not exist.
    async fn update(&self, sandbox: &Sandbox) -> SandcoreResult<Option<Sandbox>>;

    /// Sets the status and error message, refreshing `updated_at`.
    async fn update_status(
        &self,
        id: &str,
        status: SandboxStatus,
        error: Option<String>,
    ) -> SandcoreResult<Option<Sandbox>>;

    /// Deletes a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> SandcoreResult<bool>;

    /// Every record, oldest first.
    async fn list(&self) -> SandcoreResult<Vec<Sandbox>>;

    /// Number of records in `status`.
    async fn count_by_status(&self, status: SandboxStatus) -> SandcoreResult<usize>;
}

/// Keeps sandbox records in memory.
#[derive(Debug, Default)]
pub struct MemorySandboxStore {
    records: Mutex<BTreeMap<String, Sandbox>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemorySandboxStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Sandbox>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxStore for MemorySandboxStore {
    async fn create(&self, sandbox: &Sandbox) -> SandcoreResult<()> {
        self.lock().insert(sandbox.id.clone(), sandbox.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> SandcoreResult<Option<Sandbox>> {
        Ok(self.lock().get(id).cloned())
    }

    async fn update(&self, sandbox: &Sandbox) -> SandcoreResult<Option<Sandbox>> {
        let mut records = self.lock();
        let Some(record) = records.get_mut(&sandbox.id) else {
            return Ok(None);
        };

        *record = sandbox.clone();
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn update_status(
        &self,
        id: &str,
        status: SandboxStatus,
        error: Option<String>,
    ) -> SandcoreResult<Option<Sandbox>> {
        let mut records = self.lock();
        let Some(record) = records.get_mut(id) else {
            return Ok(None);
        };

        record.status = status;
        record.runtime.error = error;
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn delete(&self, id: &str) -> SandcoreResult<bool> {
        Ok(self.lock().remove(id).is_some())
    }

    async fn list(&self) -> SandcoreResult<Vec<Sandbox>> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn count_by_status(&self, status: SandboxStatus) -> SandcoreResult<usize> {
        Ok(self.lock().values().filter(|s| s.status == status).count())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
