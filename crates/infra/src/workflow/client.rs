//! Producer-side handle for creating and observing workflow instances.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use billrun_core::{Cancelled, InstanceId, StoreError};
use billrun_workflow::{WorkflowInstance, WorkflowResult};

use super::store::HistoryStore;

/// Published by a started dispatcher through its readiness gate.
///
/// Clones share the same store and wake-up signal.
#[derive(Clone)]
pub struct WorkflowClient {
    store: Arc<dyn HistoryStore>,
    wake: Arc<Notify>,
}

impl WorkflowClient {
    pub(crate) fn new(store: Arc<dyn HistoryStore>, wake: Arc<Notify>) -> Self {
        Self { store, wake }
    }

    /// Create an instance of `orchestrator_kind`, or return the id of the
    /// existing instance if `instance_id` is already taken.
    pub async fn create_workflow_instance<I>(
        &self,
        instance_id: InstanceId,
        orchestrator_kind: &str,
        input: &I,
    ) -> WorkflowResult<InstanceId>
    where
        I: Serialize + ?Sized,
    {
        let input = serde_json::to_value(input)?;
        let (instance, created) = self
            .store
            .create_instance(&instance_id, orchestrator_kind, input, None)
            .await?;

        if created {
            info!(instance_id = %instance.instance_id, kind = orchestrator_kind, "workflow instance created");
            self.wake.notify_one();
        } else {
            debug!(
                instance_id = %instance.instance_id,
                status = instance.status.name(),
                "workflow instance already exists"
            );
        }
        Ok(instance.instance_id)
    }

    pub async fn get_instance(&self, instance_id: &InstanceId) -> WorkflowResult<Option<WorkflowInstance>> {
        Ok(self.store.get_instance(instance_id).await?)
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        instance_id: &InstanceId,
        poll_interval: Duration,
        token: &CancellationToken,
    ) -> WorkflowResult<WorkflowInstance> {
        loop {
            let instance = self
                .store
                .get_instance(instance_id)
                .await?
                .ok_or_else(|| StoreError::not_found(format!("workflow instance {instance_id}")))?;
            if instance.status.is_terminal() {
                return Ok(instance);
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Cancelled.into()),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

impl std::fmt::Debug for WorkflowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::InMemoryHistoryStore;
    use billrun_workflow::WorkflowStatus;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_create_returns_same_instance_and_wakes_once() {
        let store = InMemoryHistoryStore::arc();
        let wake = Arc::new(Notify::new());
        let client = WorkflowClient::new(store.clone(), wake.clone());
        let id = InstanceId::new("X");

        let first = client
            .create_workflow_instance(id.clone(), "kind", &json!({"a": 1}))
            .await
            .unwrap();
        let second = client
            .create_workflow_instance(id.clone(), "kind", &json!({"a": 1}))
            .await
            .unwrap();

        assert_eq!(first, id);
        assert_eq!(second, id);
        assert_eq!(store.len(), 1);
        // The stored permit from the first create is consumed immediately.
        tokio::time::timeout(Duration::from_millis(50), wake.notified())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_terminal_polls_until_done() {
        let store = InMemoryHistoryStore::arc();
        let client = WorkflowClient::new(store.clone(), Arc::new(Notify::new()));
        let id = client
            .create_workflow_instance(InstanceId::new("X"), "kind", &json!(null))
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let client = client.clone();
            let id = id.clone();
            async move {
                client
                    .wait_for_terminal(&id, Duration::from_millis(100), &CancellationToken::new())
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        store
            .set_status(&id, &WorkflowStatus::Completed { output: json!(1) })
            .await
            .unwrap();

        let done = waiter.await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed { output: json!(1) });
    }

    #[tokio::test]
    async fn wait_for_terminal_is_cancellable() {
        let store = InMemoryHistoryStore::arc();
        let client = WorkflowClient::new(store, Arc::new(Notify::new()));
        let id = client
            .create_workflow_instance(InstanceId::new("X"), "kind", &json!(null))
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = client
            .wait_for_terminal(&id, Duration::from_secs(60), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
