//! Workflow error taxonomy.

use thiserror::Error;

use billrun_core::{Cancelled, InstanceId, StoreError};

use crate::history::StepKind;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Error returned by an activity handler for a single attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivityError {
    /// Retryable per the step's retry policy.
    #[error("{0}")]
    Transient(String),

    /// Not worth retrying; the step fails immediately.
    #[error("{0}")]
    Permanent(String),
}

impl ActivityError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ActivityError::Transient(m) | ActivityError::Permanent(m) => m,
        }
    }
}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid activity payload: {err}"))
    }
}

/// Error surfaced to orchestrators and to the dispatcher.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorkflowError {
    /// Outer shutdown; the instance stays `Running` and resumes later.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// An activity step exhausted its retries (or failed permanently).
    #[error("activity '{type_tag}' (step {step_index}) failed after {attempts} attempt(s): {message}")]
    ActivityFailed {
        step_index: u32,
        type_tag: String,
        attempts: u32,
        message: String,
    },

    /// A sub-orchestration step exhausted its retries.
    #[error("sub-orchestration '{type_tag}' (step {step_index}) failed after {attempts} attempt(s): {message}")]
    SubOrchestrationFailed {
        step_index: u32,
        type_tag: String,
        attempts: u32,
        message: String,
    },

    /// Replay issued a different call than the one recorded at this index.
    #[error("non-deterministic replay of {instance_id} at step {step_index}: recorded {recorded}, issued {issued}")]
    NonDeterministic {
        instance_id: InstanceId,
        step_index: u32,
        recorded: String,
        issued: String,
    },

    /// No handler registered for a type tag.
    #[error("no {kind} registered for type tag '{type_tag}'")]
    UnknownType { kind: StepKind, type_tag: String },

    /// Input or output could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Persisting progress failed; the turn is abandoned and retried later.
    #[error("history store: {0}")]
    Store(#[from] StoreError),

    /// Failure raised by orchestrator logic itself.
    #[error("{0}")]
    Orchestration(String),
}

impl WorkflowError {
    pub fn orchestration(msg: impl Into<String>) -> Self {
        Self::Orchestration(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled(_))
    }

    /// Errors after which the instance must stay `Running` so a later turn
    /// (possibly in another process) can resume it.
    pub fn is_resumable(&self) -> bool {
        matches!(self, WorkflowError::Cancelled(_) | WorkflowError::Store(_))
    }

    /// Step failure built from a recorded outcome.
    pub fn step_failed(
        kind: StepKind,
        step_index: u32,
        type_tag: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        let type_tag = type_tag.into();
        let message = message.into();
        match kind {
            StepKind::Activity => WorkflowError::ActivityFailed {
                step_index,
                type_tag,
                attempts,
                message,
            },
            StepKind::SubOrchestration => WorkflowError::SubOrchestrationFailed {
                step_index,
                type_tag,
                attempts,
                message,
            },
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_are_retryable() {
        let err: ActivityError = anyhow::anyhow!("smtp timeout").into();
        assert!(err.is_retryable());
        assert_eq!(err.message(), "smtp timeout");
    }

    #[test]
    fn only_cancellation_and_store_errors_are_resumable() {
        assert!(WorkflowError::from(Cancelled).is_resumable());
        assert!(WorkflowError::from(StoreError::conflict("step 3 exists")).is_resumable());
        assert!(!WorkflowError::orchestration("bad input").is_resumable());
        assert!(
            !WorkflowError::step_failed(StepKind::Activity, 0, "render", 3, "boom").is_resumable()
        );
    }
}
