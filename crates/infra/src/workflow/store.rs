//! Workflow history storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use billrun_core::{Clock, InstanceId, StoreError, StoreResult, SystemClock};
use billrun_workflow::{StepRecord, WorkflowInstance, WorkflowStatus};

/// Durable store for workflow instances and their append-only step history.
///
/// ## Contract
///
/// - `create_instance` is idempotent on the instance id
/// - `append_step` only accepts the next step index of a running instance
/// - terminal statuses are immutable
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Create backing tables if they do not exist.
    async fn ensure_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Create an instance, or return the existing one with `created = false`.
    async fn create_instance(
        &self,
        instance_id: &InstanceId,
        orchestrator_kind: &str,
        input: JsonValue,
        parent_id: Option<&InstanceId>,
    ) -> StoreResult<(WorkflowInstance, bool)>;

    /// Instance with its full history.
    async fn get_instance(&self, instance_id: &InstanceId) -> StoreResult<Option<WorkflowInstance>>;

    /// Append a finished step.
    ///
    /// Fails with `Conflict` if `record.step_index` is not the next index or
    /// the instance is terminal, and with `NotFound` for an unknown instance.
    async fn append_step(&self, instance_id: &InstanceId, record: &StepRecord) -> StoreResult<()>;

    /// Update the status. Fails with `Conflict` if the instance is already terminal.
    async fn set_status(&self, instance_id: &InstanceId, status: &WorkflowStatus) -> StoreResult<()>;

    /// Recorded steps in index order.
    async fn load_history(&self, instance_id: &InstanceId) -> StoreResult<Vec<StepRecord>>;

    /// Running root instances, oldest first.
    async fn list_runnable(&self, limit: usize) -> StoreResult<Vec<InstanceId>>;
}

#[async_trait]
impl<S: HistoryStore + ?Sized> HistoryStore for Arc<S> {
    async fn ensure_schema(&self) -> StoreResult<()> {
        (**self).ensure_schema().await
    }

    async fn create_instance(
        &self,
        instance_id: &InstanceId,
        orchestrator_kind: &str,
        input: JsonValue,
        parent_id: Option<&InstanceId>,
    ) -> StoreResult<(WorkflowInstance, bool)> {
        (**self)
            .create_instance(instance_id, orchestrator_kind, input, parent_id)
            .await
    }

    async fn get_instance(&self, instance_id: &InstanceId) -> StoreResult<Option<WorkflowInstance>> {
        (**self).get_instance(instance_id).await
    }

    async fn append_step(&self, instance_id: &InstanceId, record: &StepRecord) -> StoreResult<()> {
        (**self).append_step(instance_id, record).await
    }

    async fn set_status(&self, instance_id: &InstanceId, status: &WorkflowStatus) -> StoreResult<()> {
        (**self).set_status(instance_id, status).await
    }

    async fn load_history(&self, instance_id: &InstanceId) -> StoreResult<Vec<StepRecord>> {
        (**self).load_history(instance_id).await
    }

    async fn list_runnable(&self, limit: usize) -> StoreResult<Vec<InstanceId>> {
        (**self).list_runnable(limit).await
    }
}

#[derive(Debug, Default)]
struct Instances {
    by_id: HashMap<InstanceId, WorkflowInstance>,
    /// Creation order, for oldest-first polling
    order: Vec<InstanceId>,
}

/// In-memory history store for tests/dev.
pub struct InMemoryHistoryStore {
    instances: RwLock<Instances>,
    clock: Arc<dyn Clock>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            instances: RwLock::new(Instances::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored instances, children included.
    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Instances> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Instances> {
        self.instances.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryHistoryStore")
            .field("instances", &self.len())
            .finish()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(
        &self,
        instance_id: &InstanceId,
        orchestrator_kind: &str,
        input: JsonValue,
        parent_id: Option<&InstanceId>,
    ) -> StoreResult<(WorkflowInstance, bool)> {
        let mut instances = self.write();
        if let Some(existing) = instances.by_id.get(instance_id) {
            return Ok((existing.clone(), false));
        }

        let instance = WorkflowInstance::new(
            instance_id.clone(),
            orchestrator_kind,
            input,
            parent_id.cloned(),
            self.clock.now(),
        );
        instances.by_id.insert(instance_id.clone(), instance.clone());
        instances.order.push(instance_id.clone());
        Ok((instance, true))
    }

    async fn get_instance(&self, instance_id: &InstanceId) -> StoreResult<Option<WorkflowInstance>> {
        Ok(self.read().by_id.get(instance_id).cloned())
    }

    async fn append_step(&self, instance_id: &InstanceId, record: &StepRecord) -> StoreResult<()> {
        let now = self.clock.now();
        let mut instances = self.write();
        let instance = instances
            .by_id
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::not_found(format!("workflow instance {instance_id}")))?;

        if instance.status.is_terminal() {
            return Err(StoreError::conflict(format!(
                "workflow instance {instance_id} is {}",
                instance.status.name()
            )));
        }
        if record.step_index != instance.next_step_index() {
            return Err(StoreError::conflict(format!(
                "workflow instance {instance_id} expects step {}, got {}",
                instance.next_step_index(),
                record.step_index
            )));
        }

        instance.history.push(record.clone());
        instance.updated_at = now;
        Ok(())
    }

    async fn set_status(&self, instance_id: &InstanceId, status: &WorkflowStatus) -> StoreResult<()> {
        let now = self.clock.now();
        let mut instances = self.write();
        let instance = instances
            .by_id
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::not_found(format!("workflow instance {instance_id}")))?;

        if instance.status.is_terminal() {
            return Err(StoreError::conflict(format!(
                "workflow instance {instance_id} is already {}",
                instance.status.name()
            )));
        }

        instance.status = status.clone();
        instance.updated_at = now;
        Ok(())
    }

    async fn load_history(&self, instance_id: &InstanceId) -> StoreResult<Vec<StepRecord>> {
        self.read()
            .by_id
            .get(instance_id)
            .map(|instance| instance.history.clone())
            .ok_or_else(|| StoreError::not_found(format!("workflow instance {instance_id}")))
    }

    async fn list_runnable(&self, limit: usize) -> StoreResult<Vec<InstanceId>> {
        let instances = self.read();
        Ok(instances
            .order
            .iter()
            .filter(|id| {
                instances
                    .by_id
                    .get(*id)
                    .is_some_and(|i| i.is_root() && !i.status.is_terminal())
            })
            .take(limit)
            .cloned()
            .collect())
    }
}
