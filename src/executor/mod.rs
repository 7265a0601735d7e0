//! Agent iteration loop
//!
//! Turns a single task into a bounded sequence of think -> act -> observe
//! steps. Each iteration sends the conversation to the agent's LLM,
//! classifies the reply, and either finishes the task, invokes a tool,
//! or appends to the history and continues. Pause and stop signals are
//! honored cooperatively at iteration boundaries; an in-flight LLM call
//! always completes first.

pub mod parser;
pub mod prompts;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::{Agent, AgentStatus, Task, TaskStatus, WorkflowStatus};
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmClient, LlmError};
use crate::queue::{WorkItem, WorkRunner};
use crate::store::TeamStore;
use crate::tools::{ERROR_LLM_PARSE, ERROR_MAX_ITERATIONS, ERROR_TOOL_INVOCATION};

use parser::{ParsedOutput, parse_llm_output};

/// Transport-level retry attempts within a single iteration
const LLM_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for the jittered exponential backoff between retries
const RETRY_BASE_MS: u64 = 200;

/// Response token budget per LLM call
const MAX_COMPLETION_TOKENS: u32 = 4096;

/// Runs agent iteration loops for queued work items
pub struct AgentExecutor {
    store: TeamStore,
}

impl AgentExecutor {
    pub fn new(store: TeamStore) -> Self {
        Self { store }
    }

    /// Execute the bounded think-act loop for one work item
    async fn work_on_task(&self, item: &WorkItem) -> eyre::Result<()> {
        let store = &self.store;
        let Some(task) = store.task(&item.task_id) else {
            return Ok(());
        };
        let Some(agent) = store.agent(&item.agent_id) else {
            return Ok(());
        };

        if task.status != TaskStatus::Doing || task.execution_epoch != item.epoch {
            debug!(task_id = %task.id, "stale work item; dropping");
            return Ok(());
        }

        let (mut history, mut iterations) = if item.resume {
            (agent.interactions.clone(), agent.current_iterations)
        } else {
            (Vec::new(), 0)
        };

        let feedback = store.consume_pending_feedback(&task.id)?;
        let system_prompt = prompts::system_prompt(&agent);

        if history.is_empty() {
            history.push(ChatMessage::user(prompts::task_prompt(&task, &item.context, &feedback)));
        } else if !feedback.is_empty() {
            history.push(ChatMessage::user(prompts::feedback_prompt(&feedback)));
        }

        let mut nudged = false;

        loop {
            // The task may have been re-planned (revision ripple) while
            // this loop was mid-flight
            let Some(current) = store.task(&task.id) else {
                return Ok(());
            };
            if current.status != TaskStatus::Doing || current.execution_epoch != item.epoch {
                debug!(task_id = %task.id, "task re-planned externally; dropping loop");
                return Ok(());
            }

            // Cooperative pause/stop check at the iteration boundary
            match store.workflow_status() {
                WorkflowStatus::Paused => {
                    store.checkpoint_agent(&agent.id, history.clone(), iterations)?;
                    store.update_task_status(&task.id, TaskStatus::Paused)?;
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::Paused,
                        Some(&task.id),
                        format!("Agent {} paused on task {}", agent.name, task.id),
                        json!({ "iteration": iterations }),
                    )?;
                    return Ok(());
                }
                WorkflowStatus::Stopping | WorkflowStatus::Stopped => {
                    store.update_task_status(&task.id, TaskStatus::Aborted)?;
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::TaskAborted,
                        Some(&task.id),
                        format!("Agent {} aborted task {}", agent.name, task.id),
                        json!({ "iteration": iterations }),
                    )?;
                    return Ok(());
                }
                _ => {}
            }

            if iterations >= agent.max_iterations {
                store.update_agent_status(
                    &agent.id,
                    AgentStatus::MaxIterationsError,
                    Some(&task.id),
                    format!(
                        "{}: agent {} exhausted {} iterations on task {}",
                        ERROR_MAX_ITERATIONS, agent.name, agent.max_iterations, task.id
                    ),
                    json!({ "max_iterations": agent.max_iterations }),
                )?;
                store.update_task_status(&task.id, TaskStatus::Blocked)?;
                return Ok(());
            }

            store.update_agent_status(
                &agent.id,
                AgentStatus::IterationStart,
                Some(&task.id),
                format!("Agent {}: iteration {}/{}", agent.name, iterations + 1, agent.max_iterations),
                json!({ "iteration": iterations }),
            )?;

            if !nudged && iterations >= agent.force_final_answer_threshold() {
                history.push(ChatMessage::user(prompts::force_final_nudge()));
                nudged = true;
            }

            store.update_agent_status(
                &agent.id,
                AgentStatus::Thinking,
                Some(&task.id),
                "",
                json!({ "iteration": iterations }),
            )?;

            let request = CompletionRequest {
                system_prompt: system_prompt.clone(),
                messages: history.clone(),
                max_tokens: MAX_COMPLETION_TOKENS,
            };

            let response = match call_llm_with_retry(agent.llm.as_ref(), request).await {
                Ok(response) => {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::ThinkingEnd,
                        Some(&task.id),
                        "",
                        json!({
                            "model": agent.llm.model(),
                            "input_tokens": response.usage.input_tokens,
                            "output_tokens": response.usage.output_tokens,
                        }),
                    )?;
                    response
                }
                Err(error) if error.is_retryable() => {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::ThinkingError,
                        Some(&task.id),
                        format!("Agent {}: LLM call failed: {}", agent.name, error),
                        json!({ "retryable": true }),
                    )?;
                    iterations += 1;
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::IterationEnd,
                        Some(&task.id),
                        "",
                        json!({ "iteration": iterations - 1 }),
                    )?;
                    store.checkpoint_agent(&agent.id, history.clone(), iterations)?;
                    continue;
                }
                Err(error) => {
                    // Fatal transport error (auth, malformed request):
                    // burning the remaining budget cannot help
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::ThinkingError,
                        Some(&task.id),
                        format!("Agent {}: fatal LLM error: {}", agent.name, error),
                        json!({ "retryable": false }),
                    )?;
                    store.update_task_status(&task.id, TaskStatus::Blocked)?;
                    return Ok(());
                }
            };

            history.push(ChatMessage::assistant(response.content.clone()));

            match parse_llm_output(&response.content) {
                Ok(ParsedOutput::FinalAnswer(answer)) => {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::FinalAnswer,
                        Some(&task.id),
                        format!("Agent {} produced a final answer for task {}", agent.name, task.id),
                        json!({ "iteration": iterations }),
                    )?;
                    let final_status = if task.external_validation_required {
                        TaskStatus::AwaitingValidation
                    } else {
                        TaskStatus::Done
                    };
                    store.checkpoint_agent(&agent.id, history.clone(), iterations + 1)?;
                    store.record_task_result(&task.id, answer, final_status)?;
                    return Ok(());
                }
                Ok(ParsedOutput::ToolAction { tool, input }) => {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::ExecutingAction,
                        Some(&task.id),
                        format!("Agent {} requested tool {}", agent.name, tool),
                        json!({ "tool": tool, "input": input }),
                    )?;
                    self.invoke_tool(&agent, &task, &tool, input, &mut history).await?;
                }
                Ok(ParsedOutput::SelfQuestion(question)) => {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::SelfQuestion,
                        Some(&task.id),
                        format!("Agent {} asked itself a question", agent.name),
                        json!({ "question": question }),
                    )?;
                    history.push(ChatMessage::user(question));
                }
                Ok(ParsedOutput::Observation(_)) => {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::Observation,
                        Some(&task.id),
                        format!("Agent {} recorded an observation", agent.name),
                        json!({ "iteration": iterations }),
                    )?;
                }
                Err(parse_error) => {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::IssuesParsingLlmOutput,
                        Some(&task.id),
                        format!("{}: {}", ERROR_LLM_PARSE, parse_error),
                        json!({ "iteration": iterations }),
                    )?;
                    history.push(ChatMessage::user(prompts::corrective_nudge()));
                }
            }

            iterations += 1;
            store.update_agent_status(
                &agent.id,
                AgentStatus::IterationEnd,
                Some(&task.id),
                "",
                json!({ "iteration": iterations - 1 }),
            )?;
            store.checkpoint_agent(&agent.id, history.clone(), iterations)?;
        }
    }

    /// Look up and invoke a tool, appending the outcome as an observation
    ///
    /// Tool failures are never fatal: the error text goes into the history
    /// and the loop continues.
    async fn invoke_tool(
        &self,
        agent: &Agent,
        task: &Task,
        tool_name: &str,
        input: serde_json::Value,
        history: &mut Vec<ChatMessage>,
    ) -> eyre::Result<()> {
        let store = &self.store;
        match agent.tool(tool_name) {
            Some(tool) => {
                store.update_agent_status(
                    &agent.id,
                    AgentStatus::UsingTool,
                    Some(&task.id),
                    format!("Agent {} using tool {}", agent.name, tool_name),
                    json!({ "tool": tool_name }),
                )?;
                let result = tool.invoke(input).await;
                if result.is_error {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::UsingToolError,
                        Some(&task.id),
                        format!("{}: tool {} failed", ERROR_TOOL_INVOCATION, tool_name),
                        json!({ "tool": tool_name, "error": result.content }),
                    )?;
                    history.push(ChatMessage::user(format!(
                        "{}: tool '{}' failed: {}",
                        ERROR_TOOL_INVOCATION, tool_name, result.content
                    )));
                } else {
                    store.update_agent_status(
                        &agent.id,
                        AgentStatus::UsingToolEnd,
                        Some(&task.id),
                        format!("Agent {} finished tool {}", agent.name, tool_name),
                        json!({ "tool": tool_name, "result": result.content }),
                    )?;
                    history.push(ChatMessage::user(format!(
                        "Tool '{}' returned: {}",
                        tool_name, result.content
                    )));
                }
            }
            None => {
                store.update_agent_status(
                    &agent.id,
                    AgentStatus::UsingToolError,
                    Some(&task.id),
                    format!("{}: unknown tool: {}", ERROR_TOOL_INVOCATION, tool_name),
                    json!({ "tool": tool_name }),
                )?;
                let available: Vec<&str> = agent.tools.iter().map(|t| t.name()).collect();
                history.push(ChatMessage::user(format!(
                    "{}: there is no tool named '{}'. Available tools: [{}]",
                    ERROR_TOOL_INVOCATION,
                    tool_name,
                    available.join(", ")
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkRunner for AgentExecutor {
    async fn run(&self, item: WorkItem) {
        if let Err(error) = self.work_on_task(&item).await {
            warn!(task_id = %item.task_id, error = %error, "agent loop ended with an error");
        }
    }
}

/// Call the LLM with in-iteration retries for transient failures
///
/// Rate limits honor the server-provided delay; other retryable errors
/// back off exponentially with jitter. Fatal errors return immediately.
async fn call_llm_with_retry(llm: &dyn LlmClient, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
    let mut last_error: Option<LlmError> = None;

    for attempt in 0..LLM_RETRY_ATTEMPTS {
        if attempt > 0 {
            let delay = match last_error.as_ref().and_then(|e| e.retry_after()) {
                Some(after) => after,
                None => {
                    let jitter = rand::rng().random_range(0..100);
                    Duration::from_millis(RETRY_BASE_MS * 2u64.pow(attempt - 1) + jitter)
                }
            };
            warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying LLM call");
            tokio::time::sleep(delay).await;
        }

        match llm.complete(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(error) if error.is_retryable() => {
                last_error = Some(error);
            }
            Err(error) => return Err(error),
        }
    }

    Err(last_error.unwrap_or_else(|| LlmError::InvalidResponse("retry budget exhausted".to_string())))
}
