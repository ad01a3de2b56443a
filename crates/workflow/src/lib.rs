//! Durable workflow mechanics (framework only, no storage or runtime).
//!
//! - Orchestrators are deterministic async functions that issue steps through
//!   an [`OrchestrationContext`]
//! - Activities are registered handlers keyed by a type tag
//! - Every finished step is recorded as a [`StepRecord`]; re-running an
//!   orchestrator against its history replays recorded outputs instead of
//!   invoking handlers again
//!
//! The runtime that persists history and actually executes steps implements
//! [`StepRunner`] (see `billrun-infra`).

pub mod context;
pub mod error;
pub mod history;
pub mod registry;

pub use context::{OrchestrationContext, StepInvocation, StepRunner};
pub use error::{ActivityError, WorkflowError, WorkflowResult};
pub use history::{StepKind, StepOutcome, StepRecord, WorkflowInstance, WorkflowStatus};
pub use registry::{ActivityHandler, OrchestratorFn, Registry};
