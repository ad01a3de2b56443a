//! Replay-safe orchestration context.
//!
//! An orchestrator is re-run from the top on every turn. Each step call takes
//! the next step index; when that index is already in the recorded history the
//! context verifies the call matches the record and hands back the recorded
//! outcome without touching the handler. The first unrecorded index is handed
//! to the [`StepRunner`], which executes it (with retries) and persists it.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use billrun_core::{Cancelled, InstanceId, RetryPolicy};

use crate::error::{WorkflowError, WorkflowResult};
use crate::history::{StepKind, StepOutcome, StepRecord};

/// A step the orchestrator issued that has no recorded outcome yet.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInvocation {
    pub instance_id: InstanceId,
    pub step_index: u32,
    pub kind: StepKind,
    pub type_tag: String,
    pub input: JsonValue,
    pub retry_policy: RetryPolicy,
}

impl StepInvocation {
    fn describe(&self) -> String {
        describe(self.kind, &self.type_tag, &self.input)
    }
}

/// Executes unrecorded steps on behalf of an orchestration.
#[async_trait]
pub trait StepRunner: Send + Sync + 'static {
    /// Run `invocation` through all of its attempts, persist the resulting
    /// record in the instance history, and return it.
    ///
    /// A step that exhausts its retries is an `Ok` record with a failed
    /// outcome; `Err` is reserved for cancellation, persistence failures and
    /// unknown type tags.
    async fn run_step(
        &self,
        invocation: StepInvocation,
        cancel: CancellationToken,
    ) -> WorkflowResult<StepRecord>;
}

struct ReplayState {
    history: Vec<StepRecord>,
    next_index: u32,
    /// First cancellation or persistence failure of this turn; every later
    /// call fails with it.
    interrupted: Option<WorkflowError>,
}

struct ContextInner {
    instance_id: InstanceId,
    runner: Arc<dyn StepRunner>,
    cancel: CancellationToken,
    state: Mutex<ReplayState>,
}

/// Handle passed to orchestrator functions for issuing steps.
///
/// Steps must be awaited one at a time: the call order is the replay key.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<ContextInner>,
}

impl OrchestrationContext {
    pub fn new(
        instance_id: InstanceId,
        history: Vec<StepRecord>,
        runner: Arc<dyn StepRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                instance_id,
                runner,
                cancel,
                state: Mutex::new(ReplayState {
                    history,
                    next_index: 0,
                    interrupted: None,
                }),
            }),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    /// True while the orchestrator is re-deriving steps that are already recorded.
    pub fn is_replaying(&self) -> bool {
        let state = self.lock();
        (state.next_index as usize) < state.history.len()
    }

    /// Number of steps issued so far in this turn.
    pub fn steps_issued(&self) -> u32 {
        self.lock().next_index
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// The error that interrupted this turn, if any.
    ///
    /// Once set, the turn must be abandoned whatever the orchestrator
    /// returns: the instance stays running and resumes from its history.
    pub fn interruption(&self) -> Option<WorkflowError> {
        self.lock().interrupted.clone()
    }

    /// Invoke a registered activity.
    pub async fn call_activity<I, O>(
        &self,
        type_tag: &str,
        input: &I,
        retry_policy: RetryPolicy,
    ) -> WorkflowResult<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        self.call(StepKind::Activity, type_tag, input, retry_policy).await
    }

    /// Invoke another orchestrator as a nested instance.
    pub async fn call_sub_orchestration<I, O>(
        &self,
        type_tag: &str,
        input: &I,
        retry_policy: RetryPolicy,
    ) -> WorkflowResult<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        self.call(StepKind::SubOrchestration, type_tag, input, retry_policy).await
    }

    async fn call<O: DeserializeOwned>(
        &self,
        kind: StepKind,
        type_tag: &str,
        input: JsonValue,
        retry_policy: RetryPolicy,
    ) -> WorkflowResult<O> {
        let (step_index, recorded, in_flight) = {
            let mut state = self.lock();
            if let Some(err) = &state.interrupted {
                return Err(err.clone());
            }
            if self.inner.cancel.is_cancelled() {
                let err = WorkflowError::from(Cancelled);
                state.interrupted = Some(err.clone());
                return Err(err);
            }
            let index = state.next_index;
            state.next_index += 1;
            let recorded = state.history.get(index as usize).cloned();
            (index, recorded, index as usize > state.history.len())
        };
        let invocation = StepInvocation {
            instance_id: self.inner.instance_id.clone(),
            step_index,
            kind,
            type_tag: type_tag.to_string(),
            input,
            retry_policy,
        };

        let record = match recorded {
            Some(record) => {
                self.verify_replay(&record, &invocation)?;
                debug!(
                    instance_id = %invocation.instance_id,
                    step_index,
                    type_tag,
                    "replayed recorded step"
                );
                record
            }
            None if in_flight => {
                return Err(WorkflowError::orchestration(format!(
                    "step {step_index} ({}) issued while an earlier step is still running; steps must be awaited in order",
                    invocation.describe()
                )));
            }
            None => {
                let record = match self
                    .inner
                    .runner
                    .run_step(invocation, self.inner.cancel.clone())
                    .await
                {
                    Ok(record) => record,
                    Err(err) => {
                        if err.is_resumable() {
                            let mut state = self.lock();
                            if state.interrupted.is_none() {
                                state.interrupted = Some(err.clone());
                            }
                        }
                        return Err(err);
                    }
                };
                self.lock().history.push(record.clone());
                record
            }
        };

        match record.outcome {
            StepOutcome::Completed { output } => Ok(serde_json::from_value(output)?),
            StepOutcome::Failed { error } => Err(WorkflowError::step_failed(
                record.kind,
                record.step_index,
                record.type_tag,
                record.attempts,
                error,
            )),
        }
    }

    fn verify_replay(&self, record: &StepRecord, issued: &StepInvocation) -> WorkflowResult<()> {
        if record.kind == issued.kind
            && record.type_tag == issued.type_tag
            && record.input == issued.input
        {
            return Ok(());
        }
        Err(WorkflowError::NonDeterministic {
            instance_id: issued.instance_id.clone(),
            step_index: issued.step_index,
            recorded: describe(record.kind, &record.type_tag, &record.input),
            issued: issued.describe(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReplayState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &self.inner.instance_id)
            .field("recorded_steps", &state.history.len())
            .field("next_index", &state.next_index)
            .finish()
    }
}

fn describe(kind: StepKind, type_tag: &str, input: &JsonValue) -> String {
    format!("{kind} '{type_tag}' with input {input}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use billrun_core::StoreError;
    use chrono::Utc;
    use serde_json::json;

    /// Runner that completes every step by echoing a canned output and
    /// remembers what it was asked to run.
    #[derive(Default)]
    struct RecordingRunner {
        invoked: Mutex<Vec<StepInvocation>>,
        fail_tags: Vec<&'static str>,
    }

    impl RecordingRunner {
        fn invoked_tags(&self) -> Vec<String> {
            self.invoked
                .lock()
                .unwrap()
                .iter()
                .map(|i| i.type_tag.clone())
                .collect()
        }
    }

    #[async_trait]
    impl StepRunner for RecordingRunner {
        async fn run_step(
            &self,
            invocation: StepInvocation,
            _cancel: CancellationToken,
        ) -> WorkflowResult<StepRecord> {
            self.invoked.lock().unwrap().push(invocation.clone());
            let outcome = if self.fail_tags.contains(&invocation.type_tag.as_str()) {
                StepOutcome::Failed {
                    error: "exhausted".to_string(),
                }
            } else {
                StepOutcome::Completed {
                    output: json!(format!("{}-out", invocation.type_tag)),
                }
            };
            Ok(StepRecord {
                step_index: invocation.step_index,
                kind: invocation.kind,
                type_tag: invocation.type_tag,
                input: invocation.input,
                attempts: 1,
                outcome,
                completed_at: Utc::now(),
            })
        }
    }

    fn completed(index: u32, tag: &str, input: JsonValue, output: JsonValue) -> StepRecord {
        StepRecord {
            step_index: index,
            kind: StepKind::Activity,
            type_tag: tag.to_string(),
            input,
            attempts: 1,
            outcome: StepOutcome::Completed { output },
            completed_at: Utc::now(),
        }
    }

    async fn render_then_email(ctx: OrchestrationContext) -> WorkflowResult<String> {
        let rendered: String = ctx
            .call_activity("render", &json!({"doc": 7}), RetryPolicy::no_retry())
            .await?;
        ctx.call_activity("email", &rendered, RetryPolicy::no_retry()).await
    }

    #[tokio::test]
    async fn replay_skips_recorded_steps_and_runs_the_next_one() {
        let runner = Arc::new(RecordingRunner::default());
        let history = vec![completed(0, "render", json!({"doc": 7}), json!("recorded-render"))];
        let ctx = OrchestrationContext::new(
            InstanceId::new("i-1"),
            history,
            runner.clone(),
            CancellationToken::new(),
        );

        let out = render_then_email(ctx.clone()).await.unwrap();

        assert_eq!(out, "email-out");
        assert_eq!(runner.invoked_tags(), vec!["email"]);
        let invoked = runner.invoked.lock().unwrap();
        assert_eq!(invoked[0].step_index, 1);
        assert_eq!(invoked[0].input, json!("recorded-render"));
        assert!(!ctx.is_replaying());
        assert_eq!(ctx.steps_issued(), 2);
    }

    #[tokio::test]
    async fn fully_recorded_history_invokes_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let history = vec![
            completed(0, "render", json!({"doc": 7}), json!("r")),
            completed(1, "email", json!("r"), json!("sent")),
        ];
        let ctx = OrchestrationContext::new(
            InstanceId::new("i-1"),
            history,
            runner.clone(),
            CancellationToken::new(),
        );

        assert_eq!(render_then_email(ctx).await.unwrap(), "sent");
        assert!(runner.invoked_tags().is_empty());
    }

    #[tokio::test]
    async fn mismatched_history_is_non_deterministic() {
        let runner = Arc::new(RecordingRunner::default());
        let history = vec![completed(0, "convert", json!({"doc": 7}), json!("r"))];
        let ctx = OrchestrationContext::new(
            InstanceId::new("i-1"),
            history,
            runner.clone(),
            CancellationToken::new(),
        );

        let err = render_then_email(ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NonDeterministic { step_index: 0, .. }));
        assert!(runner.invoked_tags().is_empty());
    }

    #[tokio::test]
    async fn recorded_failure_replays_as_the_same_error() {
        let runner = Arc::new(RecordingRunner::default());
        let mut failed = completed(0, "render", json!({"doc": 7}), json!(null));
        failed.attempts = 3;
        failed.outcome = StepOutcome::Failed {
            error: "template missing".to_string(),
        };
        let ctx = OrchestrationContext::new(
            InstanceId::new("i-1"),
            vec![failed],
            runner.clone(),
            CancellationToken::new(),
        );

        let err = render_then_email(ctx).await.unwrap_err();
        assert_eq!(
            err,
            WorkflowError::ActivityFailed {
                step_index: 0,
                type_tag: "render".to_string(),
                attempts: 3,
                message: "template missing".to_string(),
            }
        );
        assert!(runner.invoked_tags().is_empty());
    }

    #[tokio::test]
    async fn runner_failure_surfaces_as_step_error() {
        let runner = Arc::new(RecordingRunner {
            fail_tags: vec!["email"],
            ..Default::default()
        });
        let ctx = OrchestrationContext::new(
            InstanceId::new("i-1"),
            Vec::new(),
            runner.clone(),
            CancellationToken::new(),
        );

        let err = render_then_email(ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ActivityFailed { step_index: 1, .. }));
        assert_eq!(runner.invoked_tags(), vec!["render", "email"]);
    }

    #[tokio::test]
    async fn cancelled_context_does_not_start_new_steps() {
        let runner = Arc::new(RecordingRunner::default());
        let token = CancellationToken::new();
        token.cancel();
        let ctx = OrchestrationContext::new(InstanceId::new("i-1"), Vec::new(), runner.clone(), token);

        let err = render_then_email(ctx.clone()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(runner.invoked_tags().is_empty());
        assert!(ctx.interruption().is_some_and(|err| err.is_cancelled()));
    }

    /// Runner whose steps are all cut short by shutdown.
    struct InterruptedRunner {
        invoked: Mutex<Vec<String>>,
        error: WorkflowError,
    }

    #[async_trait]
    impl StepRunner for InterruptedRunner {
        async fn run_step(
            &self,
            invocation: StepInvocation,
            _cancel: CancellationToken,
        ) -> WorkflowResult<StepRecord> {
            self.invoked.lock().unwrap().push(invocation.type_tag);
            Err(self.error.clone())
        }
    }

    fn interrupted_ctx(error: WorkflowError) -> (OrchestrationContext, Arc<InterruptedRunner>) {
        let runner = Arc::new(InterruptedRunner {
            invoked: Mutex::new(Vec::new()),
            error,
        });
        let ctx = OrchestrationContext::new(
            InstanceId::new("i-1"),
            Vec::new(),
            runner.clone(),
            CancellationToken::new(),
        );
        (ctx, runner)
    }

    #[tokio::test]
    async fn compensating_branch_after_interruption_gets_the_same_error() {
        let (ctx, runner) = interrupted_ctx(Cancelled.into());

        let first = ctx
            .call_activity::<_, String>("charge", &json!(1), RetryPolicy::no_retry())
            .await
            .unwrap_err();
        let compensation = ctx
            .call_activity::<_, String>("refund", &json!(1), RetryPolicy::no_retry())
            .await
            .unwrap_err();

        assert!(first.is_cancelled());
        assert!(compensation.is_cancelled());
        assert_eq!(*runner.invoked.lock().unwrap(), vec!["charge".to_string()]);
        assert!(ctx.interruption().is_some_and(|err| err.is_cancelled()));
    }

    #[tokio::test]
    async fn swallowed_store_failure_still_marks_the_turn_interrupted() {
        let (ctx, _runner) = interrupted_ctx(StoreError::conflict("step 0 exists").into());

        let output: String = ctx
            .call_activity("charge", &json!(1), RetryPolicy::no_retry())
            .await
            .unwrap_or_else(|_| "fallback".to_string());

        assert_eq!(output, "fallback");
        assert_eq!(
            ctx.interruption(),
            Some(WorkflowError::Store(StoreError::conflict("step 0 exists")))
        );
    }

    #[tokio::test]
    async fn step_failures_do_not_interrupt_the_turn() {
        let runner = Arc::new(RecordingRunner {
            fail_tags: vec!["render"],
            ..Default::default()
        });
        let ctx = OrchestrationContext::new(
            InstanceId::new("i-1"),
            Vec::new(),
            runner.clone(),
            CancellationToken::new(),
        );

        assert!(render_then_email(ctx.clone()).await.is_err());
        assert_eq!(ctx.interruption(), None);
    }
}
