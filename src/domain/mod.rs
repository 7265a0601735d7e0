//! Domain types for teamflow
//!
//! Agents, tasks, feedback, and workflow log records. These are the value
//! types the reactive store holds; all runtime behavior lives in the
//! store, strategies, and executor modules.

mod agent;
mod id;
mod log;
mod task;

pub use agent::{Agent, AgentStatus, DEFAULT_MAX_ITERATIONS};
pub use id::generate_id;
pub use log::{AgentLogSnapshot, TaskLogSnapshot, WorkflowLog, WorkflowLogKind, WorkflowStatus};
pub use task::{Feedback, FeedbackStatus, Task, TaskStatus};
