//! Workflow log records
//!
//! Every status transition in the team (workflow, task, or agent level)
//! appends an immutable record to the workflow log. Statistics and the
//! derived execution context are reconstructed by folding over these
//! records; nothing in the log is ever mutated after the append.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::agent::{Agent, AgentStatus};
use super::task::{Task, TaskStatus};

/// Workflow status lexicon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Initial,
    Running,
    Paused,
    Stopping,
    Stopped,
    Errored,
    Blocked,
    Finished,
}

impl WorkflowStatus {
    /// Stable external string for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Errored => "ERRORED",
            Self::Blocked => "BLOCKED",
            Self::Finished => "FINISHED",
        }
    }

    /// Terminal states: the workflow will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }

    /// Settled states: nothing changes without external input
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Finished | Self::Errored | Self::Stopped | Self::Blocked)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What level of the team a log record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowLogKind {
    WorkflowStatusUpdate,
    TaskStatusUpdate,
    AgentStatusUpdate,
}

/// Snapshot of a task at log-emission time
#[derive(Debug, Clone, Serialize)]
pub struct TaskLogSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
}

impl From<&Task> for TaskLogSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            description: task.effective_description().to_string(),
            status: task.status,
            result: task.result.clone(),
        }
    }
}

/// Snapshot of an agent at log-emission time
#[derive(Debug, Clone, Serialize)]
pub struct AgentLogSnapshot {
    pub id: String,
    pub name: String,
    pub role: String,
    pub status: AgentStatus,
}

impl From<&Agent> for AgentLogSnapshot {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            role: agent.role.clone(),
            status: agent.status,
        }
    }
}

/// An immutable entry in the append-only workflow log
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowLog {
    /// Assigned at append time; non-decreasing across the log
    pub timestamp: DateTime<Utc>,

    pub kind: WorkflowLogKind,

    /// Set on WorkflowStatusUpdate records
    pub workflow_status: Option<WorkflowStatus>,

    /// Set on Task/AgentStatusUpdate records
    pub task: Option<TaskLogSnapshot>,

    /// Set on AgentStatusUpdate records
    pub agent: Option<AgentLogSnapshot>,

    /// Free-form structured metadata (token usage, iteration index, ...)
    pub metadata: Value,

    /// Human description of the transition
    pub description: String,
}

impl WorkflowLog {
    /// Record a workflow-level status transition
    pub fn workflow(status: WorkflowStatus, description: impl Into<String>, metadata: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: WorkflowLogKind::WorkflowStatusUpdate,
            workflow_status: Some(status),
            task: None,
            agent: None,
            metadata,
            description: description.into(),
        }
    }

    /// Record a task-level status transition
    pub fn task(task: &Task, description: impl Into<String>, metadata: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: WorkflowLogKind::TaskStatusUpdate,
            workflow_status: None,
            task: Some(TaskLogSnapshot::from(task)),
            agent: None,
            metadata,
            description: description.into(),
        }
    }

    /// Record an agent-level status transition, optionally bound to a task
    pub fn agent(agent: &Agent, task: Option<&Task>, description: impl Into<String>, metadata: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: WorkflowLogKind::AgentStatusUpdate,
            workflow_status: None,
            task: task.map(TaskLogSnapshot::from),
            agent: Some(AgentLogSnapshot::from(agent)),
            metadata,
            description: description.into(),
        }
    }

    /// Task status recorded in this entry, if any
    pub fn task_status(&self) -> Option<TaskStatus> {
        self.task.as_ref().map(|t| t.status)
    }

    /// Agent status recorded in this entry, if any
    pub fn agent_status(&self) -> Option<AgentStatus> {
        self.agent.as_ref().map(|a| a.status)
    }
}
