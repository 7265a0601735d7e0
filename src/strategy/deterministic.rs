//! Deterministic execution strategy
//!
//! One strategy handles both declarative topologies: a linear sequence
//! (no task declares dependencies) and an explicit DAG via `depends_on`.
//! The topology is detected once from the task list.
//!
//! Sequential mode runs one task at a time in declaration order; a
//! revision resets every later task back to TODO. Hierarchical mode runs
//! any task whose dependencies are all complete, bounded by the
//! concurrency ceiling; a revision blocks the revised task's transitive
//! dependents until it completes again.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::{Task, TaskStatus, WorkflowStatus};
use crate::error::WorkflowError;
use crate::store::TeamState;

use super::{
    ExecutionStrategy, StrategyContext, dispatch_task_to_queue, fold_task_context, owner_busy, resume_paused_tasks,
    transitive_dependencies, transitive_dependents,
};

/// Scheduler for linear sequences and explicit DAGs
pub struct DeterministicStrategy {
    hierarchical: bool,
}

impl DeterministicStrategy {
    /// Detect the topology from the task list
    pub fn for_tasks(tasks: &[Task]) -> Self {
        let hierarchical = tasks.iter().any(|t| !t.depends_on.is_empty());
        debug!(hierarchical, "deterministic strategy selected");
        Self { hierarchical }
    }

    pub fn is_hierarchical(&self) -> bool {
        self.hierarchical
    }

    /// Dispatch every currently runnable task, respecting the concurrency
    /// ceiling and agent availability
    fn dispatch_pass(&self, ctx: &StrategyContext) -> Result<(), WorkflowError> {
        let state = ctx.store.state();
        if state.workflow_status != WorkflowStatus::Running {
            return Ok(());
        }

        if self.hierarchical {
            let mut slots = self.concurrency(&state).saturating_sub(state.doing_count());
            // Agents that became busy during this pass
            let mut busy_now: HashSet<String> = HashSet::new();

            for task in &state.tasks {
                if slots == 0 {
                    break;
                }
                if task.status != TaskStatus::Todo {
                    continue;
                }
                let deps_complete = task
                    .depends_on
                    .iter()
                    .all(|dep| state.task(dep).map(|t| t.status.is_completed()).unwrap_or(false));
                if !deps_complete {
                    continue;
                }
                let busy = owner_busy(&state, task) || busy_now.contains(&task.agent_id);
                if busy && !task.allow_parallel_execution {
                    continue;
                }

                let context = self.context_for_task(&state, task);
                let executing = dispatch_task_to_queue(ctx, task, context, false)?;
                if executing == task.agent_id {
                    busy_now.insert(task.agent_id.clone());
                }
                slots -= 1;
            }
        } else {
            if state.tasks.iter().any(|t| t.status == TaskStatus::Doing) {
                return Ok(());
            }
            // Promote the first task in declaration order that has not
            // completed yet, but only if it is actually ready to run
            if let Some(task) = state.tasks.iter().find(|t| !t.status.is_completed())
                && task.status == TaskStatus::Todo
            {
                let context = self.context_for_task(&state, task);
                dispatch_task_to_queue(ctx, task, context, false)?;
            }
        }
        Ok(())
    }

    /// Block or reset downstream work for a revised task, then re-run it
    fn handle_revision(&self, ctx: &StrategyContext, task_id: &str) -> Result<(), WorkflowError> {
        let state = ctx.store.state();
        let Some(task) = state.task(task_id) else {
            return Ok(());
        };

        if self.hierarchical {
            let dependents = transitive_dependents(&state.tasks, task_id);
            let to_block: Vec<String> = state
                .tasks
                .iter()
                .filter(|t| dependents.contains(&t.id) && t.status != TaskStatus::Blocked)
                .map(|t| t.id.clone())
                .collect();
            if !to_block.is_empty() {
                debug!(task_id, blocked = to_block.len(), "blocking dependents of revised task");
                ctx.store.update_status_of_multiple_tasks(&to_block, TaskStatus::Blocked)?;
            }
        } else {
            let position = state.tasks.iter().position(|t| t.id == task_id);
            if let Some(position) = position {
                let to_reset: Vec<String> = state.tasks[position + 1..]
                    .iter()
                    .filter(|t| t.status != TaskStatus::Todo)
                    .map(|t| t.id.clone())
                    .collect();
                if !to_reset.is_empty() {
                    debug!(task_id, reset = to_reset.len(), "resetting tasks after revised task");
                    ctx.store.update_status_of_multiple_tasks(&to_reset, TaskStatus::Todo)?;
                }
            }
        }

        let context = self.context_for_task(&state, task);
        dispatch_task_to_queue(ctx, task, context, false)?;
        Ok(())
    }

    /// Restore dependents that were blocked by a revision once the
    /// revised task completes again
    fn restore_blocked_dependents(&self, ctx: &StrategyContext, task_id: &str) -> Result<(), WorkflowError> {
        let state = ctx.store.state();
        let dependents = transitive_dependents(&state.tasks, task_id);
        let to_restore: Vec<String> = state
            .tasks
            .iter()
            .filter(|t| dependents.contains(&t.id) && t.status == TaskStatus::Blocked)
            .map(|t| t.id.clone())
            .collect();
        if !to_restore.is_empty() {
            debug!(task_id, restored = to_restore.len(), "restoring blocked dependents");
            ctx.store.update_status_of_multiple_tasks(&to_restore, TaskStatus::Todo)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStrategy for DeterministicStrategy {
    fn concurrency(&self, state: &TeamState) -> usize {
        if self.hierarchical {
            state.max_concurrency.min(state.tasks.len()).max(1)
        } else {
            1
        }
    }

    async fn start_execution(&self, ctx: &StrategyContext) -> Result<(), WorkflowError> {
        let state = ctx.store.state();
        validate_dependency_graph(&state.tasks)?;
        self.dispatch_pass(ctx)
    }

    async fn execute_from_changed_tasks(&self, ctx: &StrategyContext, changed: &[String]) -> Result<(), WorkflowError> {
        for task_id in changed {
            let status = ctx.store.task(task_id).map(|t| t.status);
            match status {
                Some(TaskStatus::Revise) => self.handle_revision(ctx, task_id)?,
                Some(status) if status.is_completed() && self.hierarchical => {
                    self.restore_blocked_dependents(ctx, task_id)?;
                }
                _ => {}
            }
        }
        self.dispatch_pass(ctx)
    }

    fn context_for_task(&self, state: &TeamState, task: &Task) -> String {
        if self.hierarchical {
            let deps = transitive_dependencies(&state.tasks, &task.id);
            fold_task_context(state.tasks.iter().filter(|t| deps.contains(&t.id)))
        } else {
            let position = state.tasks.iter().position(|t| t.id == task.id).unwrap_or(0);
            fold_task_context(state.tasks[..position].iter())
        }
    }

    async fn stop_execution(&self, _ctx: &StrategyContext) {
        debug!("deterministic strategy: dispatch stopped");
    }

    async fn resume_execution(&self, ctx: &StrategyContext) -> Result<(), WorkflowError> {
        resume_paused_tasks(ctx, |state, task| self.context_for_task(state, task))?;
        self.dispatch_pass(ctx)
    }
}

/// Validate that every dependency resolves and the graph is acyclic
///
/// Cycle detection is a DFS with an explicit recursion stack; the
/// returned error carries the offending path.
pub fn validate_dependency_graph(tasks: &[Task]) -> Result<(), WorkflowError> {
    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    for task in tasks {
        for dep in &task.depends_on {
            if !task_map.contains_key(dep.as_str()) {
                return Err(WorkflowError::UnresolvedDependency {
                    task_id: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut cycle_path = Vec::new();

    for task_id in task_map.keys() {
        if !visited.contains(task_id) && has_cycle_dfs(task_id, &task_map, &mut visited, &mut rec_stack, &mut cycle_path)
        {
            warn!(?cycle_path, "dependency cycle detected");
            return Err(WorkflowError::CycleInDependencies { path: cycle_path });
        }
    }

    Ok(())
}

fn has_cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a Task>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    cycle_path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    cycle_path.push(node.to_string());

    if let Some(task) = graph.get(node) {
        for dep in &task.depends_on {
            if !visited.contains(dep.as_str()) {
                if graph.contains_key(dep.as_str()) && has_cycle_dfs(dep.as_str(), graph, visited, rec_stack, cycle_path)
                {
                    return true;
                }
            } else if rec_stack.contains(dep.as_str()) {
                cycle_path.push(dep.clone());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    cycle_path.pop();
    false
}
