//! Manager-LLM execution strategy
//!
//! Task selection is delegated to a supervisor agent: at each decision
//! point the strategy lists every task with its status and result so far,
//! and the supervisor answers with the id of the next task to run (or
//! DONE). Decisions are serialized, so at most one task executes at a
//! time. A supervisor that keeps answering nonsense fails the workflow
//! with MANAGER_LOOP.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::{Agent, Task, TaskStatus, WorkflowStatus};
use crate::error::WorkflowError;
use crate::llm::{ChatMessage, CompletionRequest};
use crate::store::TeamState;

use super::{ExecutionStrategy, StrategyContext, dispatch_task_to_queue, fold_task_context, resume_paused_tasks};

/// Attempts before the supervisor is declared stuck
const MANAGER_RETRIES: u32 = 3;

/// What the supervisor's reply resolved to
enum Selection {
    Task(String),
    Done,
    Invalid(String),
}

/// Scheduler that asks a supervisor agent which task to run next
pub struct ManagerStrategy {
    manager: Agent,
}

impl ManagerStrategy {
    pub fn new(manager: Agent) -> Self {
        Self { manager }
    }

    /// Ask the supervisor for the next task and dispatch it
    async fn decide(&self, ctx: &StrategyContext) -> Result<(), WorkflowError> {
        let state = ctx.store.state();
        if state.workflow_status != WorkflowStatus::Running {
            return Ok(());
        }
        if state.tasks.iter().any(|t| t.status == TaskStatus::Doing) {
            return Ok(());
        }
        if state.tasks.iter().all(|t| t.is_terminal()) {
            return Ok(());
        }

        for attempt in 1..=MANAGER_RETRIES {
            let request = CompletionRequest {
                system_prompt: supervisor_system_prompt(&self.manager),
                messages: vec![ChatMessage::user(decision_prompt(&state))],
                max_tokens: 200,
            };

            let reply = match self.manager.llm.complete(request).await {
                Ok(response) => response.content,
                Err(error) => {
                    warn!(attempt, error = %error, "supervisor LLM call failed");
                    continue;
                }
            };

            match select_task(&state, &reply) {
                Selection::Task(task_id) => {
                    debug!(attempt, %task_id, "supervisor selected task");
                    let task = ctx
                        .store
                        .task(&task_id)
                        .ok_or_else(|| WorkflowError::UnknownTask(task_id.clone()))?;
                    let context = self.context_for_task(&state, &task);
                    dispatch_task_to_queue(ctx, &task, context, false)?;
                    return Ok(());
                }
                Selection::Done => {
                    debug!(attempt, "supervisor declared the workflow done");
                    return Ok(());
                }
                Selection::Invalid(reason) => {
                    warn!(attempt, reason, reply = %reply, "supervisor reply rejected");
                }
            }
        }

        Err(WorkflowError::ManagerLoop(format!(
            "supervisor failed to select a valid task after {} attempts",
            MANAGER_RETRIES
        )))
    }
}

#[async_trait]
impl ExecutionStrategy for ManagerStrategy {
    fn concurrency(&self, _state: &TeamState) -> usize {
        // Supervisor decisions are serialized
        1
    }

    async fn start_execution(&self, ctx: &StrategyContext) -> Result<(), WorkflowError> {
        self.decide(ctx).await
    }

    async fn execute_from_changed_tasks(&self, ctx: &StrategyContext, _changed: &[String]) -> Result<(), WorkflowError> {
        self.decide(ctx).await
    }

    fn context_for_task(&self, state: &TeamState, _task: &Task) -> String {
        // No dependency edges in manager mode: every completed result is
        // potentially relevant
        fold_task_context(state.tasks.iter())
    }

    async fn stop_execution(&self, _ctx: &StrategyContext) {
        debug!("manager strategy: dispatch stopped");
    }

    async fn resume_execution(&self, ctx: &StrategyContext) -> Result<(), WorkflowError> {
        resume_paused_tasks(ctx, |state, task| self.context_for_task(state, task))?;
        self.decide(ctx).await
    }
}

fn supervisor_system_prompt(manager: &Agent) -> String {
    format!(
        "You are {}, a {}.\nYour goal: {}\nYou are supervising a team workflow. \
         Reply with exactly one task id to run next, or DONE if no further task should run. \
         Reply with the id only, no explanation.",
        manager.name, manager.role, manager.goal
    )
}

fn decision_prompt(state: &TeamState) -> String {
    let mut prompt = String::from("Current tasks:\n");
    for task in &state.tasks {
        prompt.push_str(&format!(
            "- id: {}\n  description: {}\n  status: {}\n  result: {}\n",
            task.id,
            task.effective_description(),
            task.status,
            task.result
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "none".to_string()),
        ));
    }
    prompt.push_str("\nWhich task should run next?");
    prompt
}

/// Resolve the supervisor's reply against the task list
fn select_task(state: &TeamState, reply: &str) -> Selection {
    // Prefer an explicit task id anywhere in the reply
    let mentioned: Vec<&Task> = state.tasks.iter().filter(|t| reply.contains(&t.id)).collect();

    if let Some(task) = mentioned.first() {
        return match task.status {
            TaskStatus::Todo | TaskStatus::Revise => Selection::Task(task.id.clone()),
            TaskStatus::Done | TaskStatus::Validated | TaskStatus::Aborted => {
                Selection::Invalid(format!("task {} is already terminal ({})", task.id, task.status))
            }
            other => Selection::Invalid(format!("task {} is not dispatchable ({})", task.id, other)),
        };
    }

    if reply.to_uppercase().contains("DONE") {
        return Selection::Done;
    }

    Selection::Invalid("reply names no known task id".to_string())
}
