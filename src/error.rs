//! Workflow error types

use thiserror::Error;

/// Errors from store mutations and workflow lifecycle operations
///
/// The `CYCLE_IN_DEPENDENCIES` and `MANAGER_LOOP` codes in the rendered
/// messages are a stable external contract.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Workflow is already running")]
    AlreadyRunning,

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("Task '{task_id}' depends on unknown task '{dependency}'")]
    UnresolvedDependency { task_id: String, dependency: String },

    #[error("CYCLE_IN_DEPENDENCIES: {}", path.join(" -> "))]
    CycleInDependencies { path: Vec<String> },

    #[error("MANAGER_LOOP: {0}")]
    ManagerLoop(String),
}
