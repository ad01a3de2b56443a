//! Workflow engine: drives one instance through its orchestrator and executes
//! the steps it issues.
//!
//! Driving an instance re-runs its orchestrator against the recorded history.
//! Recorded steps replay without touching handlers; the first unrecorded step
//! is executed here with its retry policy and appended to the history before
//! the orchestrator continues. Activities run on their own task so a panicking
//! handler becomes a failed attempt. Sub-orchestrations are child instances
//! with deterministic ids, driven inline on the parent's task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use billrun_core::{Cancelled, Clock, InstanceId, StoreError};
use billrun_workflow::{
    ActivityError, OrchestrationContext, Registry, StepInvocation, StepKind, StepOutcome, StepRecord,
    StepRunner, WorkflowError, WorkflowResult, WorkflowStatus,
};

use super::dispatcher::StatsCounters;
use super::store::HistoryStore;

struct EngineInner {
    store: Arc<dyn HistoryStore>,
    registry: Registry,
    clock: Arc<dyn Clock>,
    activity_permits: Arc<Semaphore>,
    counters: Arc<StatsCounters>,
}

/// Executes workflow instances against a history store.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        registry: Registry,
        clock: Arc<dyn Clock>,
        max_concurrent_activities: usize,
    ) -> Self {
        Self::with_counters(
            store,
            registry,
            clock,
            max_concurrent_activities,
            Arc::new(StatsCounters::default()),
        )
    }

    pub(crate) fn with_counters(
        store: Arc<dyn HistoryStore>,
        registry: Registry,
        clock: Arc<dyn Clock>,
        max_concurrent_activities: usize,
        counters: Arc<StatsCounters>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                clock,
                activity_permits: Arc::new(Semaphore::new(max_concurrent_activities.max(1))),
                counters,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Advance `instance_id` as far as it can go in one turn.
    ///
    /// Returns the terminal status once the orchestrator finishes. Cancellation
    /// and store failures come back as `Err` and leave the instance `Running`
    /// so a later turn resumes it from its history.
    pub async fn drive(
        &self,
        instance_id: &InstanceId,
        cancel: &CancellationToken,
    ) -> WorkflowResult<WorkflowStatus> {
        let instance = self
            .inner
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("workflow instance {instance_id}")))?;
        if instance.status.is_terminal() {
            return Ok(instance.status);
        }

        let kind = instance.orchestrator_kind;
        let Some(orchestrator) = self.inner.registry.orchestrator(&kind) else {
            let error = WorkflowError::orchestration(format!("no orchestrator registered for type tag '{kind}'"));
            return self.finish(instance_id, &kind, Err(error)).await;
        };

        debug!(
            instance_id = %instance_id,
            kind = %kind,
            recorded_steps = instance.history.len(),
            "driving workflow instance"
        );
        let runner: Arc<dyn StepRunner> = Arc::new(self.clone());
        let ctx = OrchestrationContext::new(instance_id.clone(), instance.history, runner, cancel.clone());
        let turn = ctx.clone();

        let result = match AssertUnwindSafe(orchestrator(ctx, instance.input))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(WorkflowError::orchestration(format!(
                "orchestrator panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        // A step cut short by shutdown or a store failure voids the turn,
        // even if the orchestrator caught the error and carried on.
        let result = match turn.interruption() {
            Some(interruption) => Err(interruption),
            None => result,
        };

        match result {
            Err(err) if err.is_resumable() => {
                if err.is_cancelled() {
                    debug!(instance_id = %instance_id, "workflow turn cancelled; instance stays running");
                } else {
                    warn!(instance_id = %instance_id, error = %err, "workflow turn abandoned; will resume");
                }
                Err(err)
            }
            result => self.finish(instance_id, &kind, result).await,
        }
    }

    async fn finish(
        &self,
        instance_id: &InstanceId,
        kind: &str,
        result: WorkflowResult<serde_json::Value>,
    ) -> WorkflowResult<WorkflowStatus> {
        let status = match result {
            Ok(output) => WorkflowStatus::Completed { output },
            Err(err) => WorkflowStatus::Failed {
                error: err.to_string(),
            },
        };
        self.inner.store.set_status(instance_id, &status).await?;

        match &status {
            WorkflowStatus::Failed { error } => {
                self.inner.counters.record_instance_failed();
                warn!(instance_id = %instance_id, kind, error = %error, "workflow instance failed");
            }
            _ => {
                self.inner.counters.record_instance_completed();
                info!(instance_id = %instance_id, kind, "workflow instance completed");
            }
        }
        Ok(status)
    }

    async fn run_activity(
        &self,
        invocation: &StepInvocation,
        cancel: &CancellationToken,
    ) -> WorkflowResult<(u32, StepOutcome)> {
        let handler = self
            .inner
            .registry
            .activity(&invocation.type_tag)
            .ok_or_else(|| WorkflowError::UnknownType {
                kind: StepKind::Activity,
                type_tag: invocation.type_tag.clone(),
            })?;
        let policy = &invocation.retry_policy;
        let mut attempt = 1;

        loop {
            if let Some(delay) = policy.delay_before_attempt(attempt) {
                backoff(delay, cancel).await?;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                permit = self.inner.activity_permits.clone().acquire_owned() => {
                    permit.map_err(|_| Cancelled)?
                }
            };
            self.inner.counters.record_activity_attempt();

            let mut task = tokio::spawn(handler(invocation.input.clone()));
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    task.abort();
                    return Err(Cancelled.into());
                }
                joined = &mut task => joined,
            };
            drop(permit);

            let error = match joined {
                Ok(Ok(output)) => {
                    debug!(
                        instance_id = %invocation.instance_id,
                        step_index = invocation.step_index,
                        type_tag = %invocation.type_tag,
                        attempt,
                        "activity completed"
                    );
                    return Ok((attempt, StepOutcome::Completed { output }));
                }
                Ok(Err(err)) => err,
                Err(join_err) if join_err.is_panic() => ActivityError::transient(format!(
                    "activity panicked: {}",
                    panic_message(join_err.into_panic().as_ref())
                )),
                Err(join_err) => ActivityError::transient(format!("activity task aborted: {join_err}")),
            };
            self.inner.counters.record_activity_failure();

            if error.is_retryable() && policy.should_retry(attempt) {
                warn!(
                    instance_id = %invocation.instance_id,
                    step_index = invocation.step_index,
                    type_tag = %invocation.type_tag,
                    attempt,
                    error = %error,
                    "activity attempt failed; retrying"
                );
                attempt += 1;
                continue;
            }

            warn!(
                instance_id = %invocation.instance_id,
                step_index = invocation.step_index,
                type_tag = %invocation.type_tag,
                attempt,
                error = %error,
                "activity failed"
            );
            return Ok((
                attempt,
                StepOutcome::Failed {
                    error: error.message().to_string(),
                },
            ));
        }
    }

    async fn run_sub_orchestration(
        &self,
        invocation: &StepInvocation,
        cancel: &CancellationToken,
    ) -> WorkflowResult<(u32, StepOutcome)> {
        if !self.inner.registry.has_orchestrator(&invocation.type_tag) {
            return Err(WorkflowError::UnknownType {
                kind: StepKind::SubOrchestration,
                type_tag: invocation.type_tag.clone(),
            });
        }
        let policy = &invocation.retry_policy;
        let mut attempt = 1;

        loop {
            if let Some(delay) = policy.delay_before_attempt(attempt) {
                backoff(delay, cancel).await?;
            }

            let child_id = invocation.instance_id.child(invocation.step_index, attempt);
            let (_, created) = self
                .inner
                .store
                .create_instance(
                    &child_id,
                    &invocation.type_tag,
                    invocation.input.clone(),
                    Some(&invocation.instance_id),
                )
                .await?;
            if created {
                debug!(parent_id = %invocation.instance_id, instance_id = %child_id, "sub-orchestration created");
            }

            let error = match Box::pin(self.drive(&child_id, cancel)).await? {
                WorkflowStatus::Completed { output } => {
                    return Ok((attempt, StepOutcome::Completed { output }));
                }
                WorkflowStatus::Failed { error } => error,
                WorkflowStatus::Running => format!("sub-orchestration {child_id} did not finish"),
            };

            if policy.should_retry(attempt) {
                warn!(
                    instance_id = %invocation.instance_id,
                    step_index = invocation.step_index,
                    type_tag = %invocation.type_tag,
                    attempt,
                    error = %error,
                    "sub-orchestration failed; retrying"
                );
                attempt += 1;
                continue;
            }
            return Ok((attempt, StepOutcome::Failed { error }));
        }
    }
}

#[async_trait]
impl StepRunner for WorkflowEngine {
    async fn run_step(
        &self,
        invocation: StepInvocation,
        cancel: CancellationToken,
    ) -> WorkflowResult<StepRecord> {
        let (attempts, outcome) = match invocation.kind {
            StepKind::Activity => self.run_activity(&invocation, &cancel).await?,
            StepKind::SubOrchestration => self.run_sub_orchestration(&invocation, &cancel).await?,
        };

        let record = StepRecord {
            step_index: invocation.step_index,
            kind: invocation.kind,
            type_tag: invocation.type_tag,
            input: invocation.input,
            attempts,
            outcome,
            completed_at: self.inner.clock.now(),
        };
        self.inner
            .store
            .append_step(&invocation.instance_id, &record)
            .await?;
        Ok(record)
    }
}

async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
