//! Lease storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use billrun_core::{JobName, StoreError, StoreResult};

use super::types::JobLeaseRecord;

/// Lease store abstraction.
///
/// Shared by every process running the same jobs; `upsert_lease` must be
/// atomic on the backing store.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Create backing tables if they do not exist.
    async fn ensure_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Current lease for `name`, if the job ever ran.
    async fn get_lease(&self, name: &JobName) -> StoreResult<Option<JobLeaseRecord>>;

    /// Create or replace the lease for `name`.
    ///
    /// Fails with `Conflict` if the stored `last_executed` is later than the
    /// one being written.
    async fn upsert_lease(
        &self,
        name: &JobName,
        last_executed: DateTime<Utc>,
        execution_count: u64,
    ) -> StoreResult<JobLeaseRecord>;
}

#[async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for Arc<S> {
    async fn ensure_schema(&self) -> StoreResult<()> {
        (**self).ensure_schema().await
    }

    async fn get_lease(&self, name: &JobName) -> StoreResult<Option<JobLeaseRecord>> {
        (**self).get_lease(name).await
    }

    async fn upsert_lease(
        &self,
        name: &JobName,
        last_executed: DateTime<Utc>,
        execution_count: u64,
    ) -> StoreResult<JobLeaseRecord> {
        (**self).upsert_lease(name, last_executed, execution_count).await
    }
}

/// In-memory lease store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: RwLock<HashMap<JobName, JobLeaseRecord>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get_lease(&self, name: &JobName) -> StoreResult<Option<JobLeaseRecord>> {
        let leases = self.leases.read().unwrap_or_else(PoisonError::into_inner);
        Ok(leases.get(name).cloned())
    }

    async fn upsert_lease(
        &self,
        name: &JobName,
        last_executed: DateTime<Utc>,
        execution_count: u64,
    ) -> StoreResult<JobLeaseRecord> {
        let mut leases = self.leases.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = leases.get(name) {
            if existing.last_executed > last_executed {
                return Err(StoreError::conflict(format!(
                    "lease for '{name}' already advanced to {}",
                    existing.last_executed
                )));
            }
        }

        let record = JobLeaseRecord {
            name: name.clone(),
            last_executed,
            execution_count,
        };
        leases.insert(name.clone(), record.clone());
        Ok(record)
    }
}
