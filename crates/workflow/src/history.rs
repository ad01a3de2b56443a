//! Workflow instance and step history model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use billrun_core::InstanceId;

/// What a step invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A registered activity handler
    Activity,
    /// A nested workflow instance
    SubOrchestration,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Activity => "activity",
            StepKind::SubOrchestration => "sub_orchestration",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a step after all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed { output: JsonValue },
    Failed { error: String },
}

impl StepOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed { .. })
    }
}

/// One finished step in an instance's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Position in the orchestrator's call sequence (0-based, gap-free)
    pub step_index: u32,
    pub kind: StepKind,
    /// Activity or orchestrator type tag
    pub type_tag: String,
    pub input: JsonValue,
    /// Attempts made before the outcome was reached
    pub attempts: u32,
    pub outcome: StepOutcome,
    pub completed_at: DateTime<Utc>,
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created or in progress
    Running,
    /// Orchestrator returned successfully
    Completed { output: JsonValue },
    /// Orchestrator returned an error (or could not be run)
    Failed { error: String },
}

impl WorkflowStatus {
    /// Terminal states are immutable once reached.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed { .. } => "completed",
            WorkflowStatus::Failed { .. } => "failed",
        }
    }
}

/// One execution of an orchestrator against specific input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: InstanceId,
    /// Orchestrator type tag
    pub orchestrator_kind: String,
    pub input: JsonValue,
    pub history: Vec<StepRecord>,
    pub status: WorkflowStatus,
    /// Set for sub-orchestrations; those are driven by their parent, never polled directly
    pub parent_id: Option<InstanceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(
        instance_id: InstanceId,
        orchestrator_kind: impl Into<String>,
        input: JsonValue,
        parent_id: Option<InstanceId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id,
            orchestrator_kind: orchestrator_kind.into(),
            input,
            history: Vec::new(),
            status: WorkflowStatus::Running,
            parent_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Index the next recorded step must carry.
    pub fn next_step_index(&self) -> u32 {
        self.history.len() as u32
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
