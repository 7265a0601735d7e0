//! Agent domain type
//!
//! An agent is an LLM-backed worker with an identity (role, goal,
//! background), an ordered tool set, and a bounded think-act loop. Agents
//! are owned by the team; when the same agent must serve two tasks in
//! parallel it is cloned with a fresh chat history.

use std::sync::Arc;

use serde::Serialize;

use crate::llm::{ChatMessage, LlmClient};
use crate::tools::Tool;

use super::id::generate_id;

/// Default iteration ceiling for the think-act loop
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Agent status lexicon
///
/// Every transition in the iteration loop is reflected here and recorded
/// in the workflow log. The serialized strings are a stable external
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[default]
    Initial,
    Thinking,
    ThinkingEnd,
    ThinkingError,
    Thought,
    ExecutingAction,
    UsingTool,
    UsingToolEnd,
    UsingToolError,
    Observation,
    FinalAnswer,
    SelfQuestion,
    IterationStart,
    IterationEnd,
    MaxIterationsError,
    TaskAborted,
    Paused,
    Resumed,
    IssuesParsingLlmOutput,
}

impl AgentStatus {
    /// Stable external string for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Thinking => "THINKING",
            Self::ThinkingEnd => "THINKING_END",
            Self::ThinkingError => "THINKING_ERROR",
            Self::Thought => "THOUGHT",
            Self::ExecutingAction => "EXECUTING_ACTION",
            Self::UsingTool => "USING_TOOL",
            Self::UsingToolEnd => "USING_TOOL_END",
            Self::UsingToolError => "USING_TOOL_ERROR",
            Self::Observation => "OBSERVATION",
            Self::FinalAnswer => "FINAL_ANSWER",
            Self::SelfQuestion => "SELF_QUESTION",
            Self::IterationStart => "ITERATION_START",
            Self::IterationEnd => "ITERATION_END",
            Self::MaxIterationsError => "MAX_ITERATIONS_ERROR",
            Self::TaskAborted => "TASK_ABORTED",
            Self::Paused => "PAUSED",
            Self::Resumed => "RESUMED",
            Self::IssuesParsingLlmOutput => "ISSUES_PARSING_LLM_OUTPUT",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An LLM-backed worker owned by a team
#[derive(Clone, Serialize)]
pub struct Agent {
    /// Unique identifier within the team
    pub id: String,

    /// Human-readable display name
    pub name: String,

    /// Role embedded into the system prompt (e.g. "Research Analyst")
    pub role: String,

    /// What the agent is trying to achieve
    pub goal: String,

    /// Background/expertise woven into the system prompt
    pub background: String,

    /// Current status, mirrored into the workflow log on every transition
    pub status: AgentStatus,

    /// Opaque LLM handle; shared between clones
    #[serde(skip)]
    pub llm: Arc<dyn LlmClient>,

    /// Ordered tool set; shared between clones
    #[serde(skip)]
    pub tools: Vec<Arc<dyn Tool>>,

    /// Chat history checkpointed at iteration boundaries (pause/resume)
    pub interactions: Vec<ChatMessage>,

    /// Iterations consumed on the current task
    pub current_iterations: u32,

    /// Iteration ceiling for the think-act loop
    pub max_iterations: u32,

    /// Iteration index at which the loop starts nudging for a final answer.
    /// Defaults to `max_iterations - 1`.
    pub force_final_answer_at: Option<u32>,
}

impl Agent {
    /// Create a new agent with the given identity and LLM handle
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        goal: impl Into<String>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let name = name.into();
        Self {
            id: generate_id("agent", &name),
            name,
            role: role.into(),
            goal: goal.into(),
            background: String::new(),
            status: AgentStatus::Initial,
            llm,
            tools: Vec::new(),
            interactions: Vec::new(),
            current_iterations: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            force_final_answer_at: None,
        }
    }

    /// Builder method to set a specific ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder method to set the background blurb
    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    /// Builder method to attach tools (order is preserved)
    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    /// Builder method to set the iteration ceiling
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Builder method to set the force-final-answer threshold
    pub fn with_force_final_answer_at(mut self, iteration: u32) -> Self {
        self.force_final_answer_at = Some(iteration);
        self
    }

    /// Find a tool by name (case-sensitive)
    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Iteration index at which the force-final-answer nudge kicks in
    pub fn force_final_answer_threshold(&self) -> u32 {
        self.force_final_answer_at
            .unwrap_or_else(|| self.max_iterations.saturating_sub(1))
    }

    /// Deep copy with a fresh history for parallel work
    ///
    /// The LLM handle and tool list are shared (stateless); the chat
    /// history and iteration counter start fresh so two tasks served by
    /// the same logical agent cannot contaminate each other.
    pub fn clone_for_parallel_work(&self) -> Self {
        Self {
            id: generate_id("agent", &self.name),
            name: self.name.clone(),
            role: self.role.clone(),
            goal: self.goal.clone(),
            background: self.background.clone(),
            status: AgentStatus::Initial,
            llm: Arc::clone(&self.llm),
            tools: self.tools.clone(),
            interactions: Vec::new(),
            current_iterations: 0,
            max_iterations: self.max_iterations,
            force_final_answer_at: self.force_final_answer_at,
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("status", &self.status)
            .field("tools", &self.tools.iter().map(|t| t.name().to_string()).collect::<Vec<_>>())
            .field("current_iterations", &self.current_iterations)
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmClient;

    fn mock_agent() -> Agent {
        Agent::new("writer", "Writer", "Write things", Arc::new(MockLlmClient::empty()))
    }

    #[test]
    fn test_agent_new_defaults() {
        let agent = mock_agent();
        assert!(agent.id.contains("-agent-writer"));
        assert_eq!(agent.status, AgentStatus::Initial);
        assert_eq!(agent.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(agent.current_iterations, 0);
        assert!(agent.interactions.is_empty());
    }

    #[test]
    fn test_force_final_answer_threshold_default() {
        let agent = mock_agent().with_max_iterations(5);
        assert_eq!(agent.force_final_answer_threshold(), 4);

        let agent = mock_agent().with_max_iterations(5).with_force_final_answer_at(2);
        assert_eq!(agent.force_final_answer_threshold(), 2);
    }

    #[test]
    fn test_clone_for_parallel_work_fresh_history() {
        let mut agent = mock_agent();
        agent.interactions.push(ChatMessage::user("hello"));
        agent.current_iterations = 3;
        agent.status = AgentStatus::FinalAnswer;

        let clone = agent.clone_for_parallel_work();
        assert_ne!(clone.id, agent.id);
        assert_eq!(clone.name, agent.name);
        assert!(clone.interactions.is_empty());
        assert_eq!(clone.current_iterations, 0);
        assert_eq!(clone.status, AgentStatus::Initial);
    }

    #[test]
    fn test_agent_status_strings() {
        assert_eq!(AgentStatus::IssuesParsingLlmOutput.to_string(), "ISSUES_PARSING_LLM_OUTPUT");
        assert_eq!(AgentStatus::MaxIterationsError.to_string(), "MAX_ITERATIONS_ERROR");
        let json = serde_json::to_string(&AgentStatus::UsingToolEnd).unwrap();
        assert_eq!(json, "\"USING_TOOL_END\"");
    }
}
