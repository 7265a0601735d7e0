//! Execution strategies
//!
//! A strategy decides which tasks become runnable on each state change
//! and how per-task context is assembled. Strategies never touch state
//! directly; everything goes through the store's atomic mutators, and
//! work reaches agents only through the execution queue.

mod deterministic;
mod manager;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Task, TaskStatus};
use crate::error::WorkflowError;
use crate::queue::{ExecutionQueue, WorkItem};
use crate::store::{TeamState, TeamStore};

pub use deterministic::{DeterministicStrategy, validate_dependency_graph};
pub use manager::ManagerStrategy;

/// Handles a strategy needs to schedule work
pub struct StrategyContext {
    pub store: TeamStore,
    pub queue: Arc<ExecutionQueue>,
}

/// Scheduler deciding which tasks run when
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Worker count for the execution queue
    fn concurrency(&self, state: &TeamState) -> usize;

    /// Validate the task graph and dispatch the initial tasks
    async fn start_execution(&self, ctx: &StrategyContext) -> Result<(), WorkflowError>;

    /// React to task status transitions
    async fn execute_from_changed_tasks(&self, ctx: &StrategyContext, changed: &[String]) -> Result<(), WorkflowError>;

    /// Aggregate prior task results relevant to this task
    fn context_for_task(&self, state: &TeamState, task: &Task) -> String;

    /// Dispatch has ceased; the queue is being torn down
    async fn stop_execution(&self, ctx: &StrategyContext);

    /// Rebuild work items for paused tasks and re-evaluate dispatch
    async fn resume_execution(&self, ctx: &StrategyContext) -> Result<(), WorkflowError>;
}

/// True when the task's owning agent is already executing another task
pub(crate) fn owner_busy(state: &TeamState, task: &Task) -> bool {
    state.tasks.iter().any(|t| {
        t.id != task.id
            && t.status == TaskStatus::Doing
            && t.executing_agent_id.as_deref().unwrap_or(t.agent_id.as_str()) == task.agent_id
    })
}

/// Mark a task DOING and hand it to the queue
///
/// If the owning agent is busy and the task allows parallel execution,
/// a clone with a fresh history is registered and used instead. Returns
/// the id of the executing agent.
pub(crate) fn dispatch_task_to_queue(
    ctx: &StrategyContext,
    task: &Task,
    context: String,
    resume: bool,
) -> Result<String, WorkflowError> {
    let state = ctx.store.state();

    let executing_agent_id = if resume {
        task.executing_agent_id.clone().unwrap_or_else(|| task.agent_id.clone())
    } else if owner_busy(&state, task) && task.allow_parallel_execution {
        let owner = state
            .agent(&task.agent_id)
            .ok_or_else(|| WorkflowError::UnknownAgent(task.agent_id.clone()))?;
        let clone = owner.clone_for_parallel_work();
        let clone_id = clone.id.clone();
        ctx.store.register_agent_clone(clone);
        clone_id
    } else {
        task.agent_id.clone()
    };

    let epoch = ctx.store.dispatch_task(&task.id, &executing_agent_id)?;
    ctx.queue.submit(WorkItem {
        task_id: task.id.clone(),
        agent_id: executing_agent_id.clone(),
        context,
        epoch,
        resume,
    });
    Ok(executing_agent_id)
}

/// Re-enter the loop for every paused task with its checkpointed history
pub(crate) fn resume_paused_tasks<F>(ctx: &StrategyContext, context_for: F) -> Result<(), WorkflowError>
where
    F: Fn(&TeamState, &Task) -> String,
{
    let state = ctx.store.state();
    for task in state.tasks.iter().filter(|t| t.status == TaskStatus::Paused) {
        ctx.store.update_task_status(&task.id, TaskStatus::Resumed)?;
        let context = context_for(&state, task);
        dispatch_task_to_queue(ctx, task, context, true)?;
    }
    Ok(())
}

/// Concatenate `Task: .. / Result: ..` lines for the given tasks, in the
/// order supplied; only completed tasks with results contribute
pub(crate) fn fold_task_context<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> String {
    let mut out = String::new();
    for task in tasks {
        if task.status.is_completed()
            && let Some(result) = &task.result
        {
            out.push_str(&format!(
                "Task: {}\nResult: {}\n",
                task.effective_description(),
                result_text(result)
            ));
        }
    }
    out
}

/// String results verbatim; structured results as canonical JSON
fn result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// IDs of every task reachable from `task_id` through `depends_on` edges
pub(crate) fn transitive_dependencies(tasks: &[Task], task_id: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = tasks
        .iter()
        .find(|t| t.id == task_id)
        .map(|t| t.depends_on.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(id) = stack.pop() {
        if seen.insert(id.to_string())
            && let Some(task) = tasks.iter().find(|t| t.id == id)
        {
            stack.extend(task.depends_on.iter().map(String::as_str));
        }
    }
    seen
}

/// IDs of every task that transitively depends on `task_id`
pub(crate) fn transitive_dependents(tasks: &[Task], task_id: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack = vec![task_id];

    while let Some(id) = stack.pop() {
        for task in tasks.iter().filter(|t| t.depends_on.iter().any(|d| d == id)) {
            if seen.insert(task.id.clone()) {
                stack.push(task.id.as_str());
            }
        }
    }
    seen
}
