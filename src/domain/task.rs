//! Task domain type
//!
//! A task is a unit of work owned by a single agent. Tasks may depend on
//! other tasks (`depends_on`), carry human feedback, and hold the result
//! produced by the owning agent's iteration loop.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::id::generate_id;

/// Task status lexicon
///
/// The serialized strings are a stable external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be picked up by the execution strategy
    #[default]
    Todo,
    /// An agent is actively working on it
    Doing,
    /// Cannot proceed (unmet dependency after a revision, or exhausted iterations)
    Blocked,
    /// Human feedback arrived; the task must be re-executed
    Revise,
    /// Completed with a result
    Done,
    /// Completed but requires external validation before it counts as done
    AwaitingValidation,
    /// Externally validated
    Validated,
    /// Cancelled by a workflow stop or an external abort
    Aborted,
    /// Checkpointed by a workflow pause
    Paused,
    /// Transitioning back from paused to doing
    Resumed,
}

impl TaskStatus {
    /// Stable external string for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "TODO",
            Self::Doing => "DOING",
            Self::Blocked => "BLOCKED",
            Self::Revise => "REVISE",
            Self::Done => "DONE",
            Self::AwaitingValidation => "AWAITING_VALIDATION",
            Self::Validated => "VALIDATED",
            Self::Aborted => "ABORTED",
            Self::Paused => "PAUSED",
            Self::Resumed => "RESUMED",
        }
    }

    /// Terminal states: nothing will change without a new workflow run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Validated | Self::Aborted)
    }

    /// States that count as "completed" for dependency resolution
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Done | Self::Validated)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Feedback entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackStatus {
    Pending,
    Processed,
}

/// A single human feedback entry attached to a task
///
/// Entries are immutable once appended; only `status` transitions
/// PENDING -> PROCESSED when the agent consumes the feedback.
#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub content: String,
    pub status: FeedbackStatus,
    pub timestamp: DateTime<Utc>,
}

impl Feedback {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: FeedbackStatus::Pending,
            timestamp: Utc::now(),
        }
    }
}

/// A unit of work owned by a single agent
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Unique identifier within the team
    pub id: String,

    /// Optional short display name
    pub name: Option<String>,

    /// Optional caller-supplied stable reference
    pub reference_id: Option<String>,

    /// Natural-language description with `{placeholder}` slots
    pub description: String,

    /// Description with workflow inputs interpolated (set at workflow start)
    pub interpolated_description: Option<String>,

    /// Narrative of what a good result looks like
    pub expected_output: String,

    /// ID of the owning agent
    pub agent_id: String,

    /// IDs of tasks that must complete before this one may start
    pub depends_on: Vec<String>,

    /// Allow the owning agent to be cloned if it is busy on another task
    pub allow_parallel_execution: bool,

    /// Marks this task's result as a workflow deliverable
    pub is_deliverable: bool,

    /// Completion requires an external `validate_task` call
    pub external_validation_required: bool,

    /// Current status
    pub status: TaskStatus,

    /// Ordered human feedback entries
    pub feedback_history: Vec<Feedback>,

    /// Result recorded on completion
    pub result: Option<Value>,

    /// Agent actually executing the task (differs from `agent_id` when a
    /// busy agent was cloned); used to recover checkpointed history on resume
    pub executing_agent_id: Option<String>,

    /// Bumped every time the task is dispatched to a worker; stale work
    /// items carry an older epoch and are dropped at iteration boundaries
    pub execution_epoch: u64,
}

impl Task {
    /// Create a new task owned by `agent_id`
    pub fn new(description: impl Into<String>, expected_output: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            id: generate_id("task", &description),
            name: None,
            reference_id: None,
            description,
            interpolated_description: None,
            expected_output: expected_output.into(),
            agent_id: agent_id.into(),
            depends_on: Vec::new(),
            allow_parallel_execution: false,
            is_deliverable: false,
            external_validation_required: false,
            status: TaskStatus::Todo,
            feedback_history: Vec::new(),
            result: None,
            executing_agent_id: None,
            execution_epoch: 0,
        }
    }

    /// Builder method to set a specific ID (callers usually want stable IDs)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder method to set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder method to set the caller reference
    pub fn with_reference_id(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    /// Builder method to declare dependencies
    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to allow agent cloning for parallel execution
    pub fn with_parallel_execution(mut self) -> Self {
        self.allow_parallel_execution = true;
        self
    }

    /// Builder method to mark the task as a deliverable
    pub fn with_deliverable(mut self) -> Self {
        self.is_deliverable = true;
        self
    }

    /// Builder method to require external validation
    pub fn with_external_validation(mut self) -> Self {
        self.external_validation_required = true;
        self
    }

    /// The description the agent should actually work from
    pub fn effective_description(&self) -> &str {
        self.interpolated_description.as_deref().unwrap_or(&self.description)
    }

    /// Check if the task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Indices of feedback entries that have not been consumed yet
    pub fn pending_feedback(&self) -> Vec<usize> {
        self.feedback_history
            .iter()
            .enumerate()
            .filter(|(_, f)| f.status == FeedbackStatus::Pending)
            .map(|(i, _)| i)
            .collect()
    }
}
