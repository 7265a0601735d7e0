//! Tool system
//!
//! Tools are capabilities agents may call from inside the iteration loop.
//! The core only defines the contract; implementations are supplied by
//! the caller when building agents. Tool failures are never fatal to a
//! workflow - they surface as error observations in the agent's history.

mod error;

use async_trait::async_trait;
use serde_json::Value;

pub use error::{
    ERROR_LLM_PARSE, ERROR_MAX_ITERATIONS, ERROR_MISSING_QUERY, ERROR_MISSING_URL, ERROR_TOOL_INVOCATION, ToolError,
};

/// A capability an agent can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (matched case-sensitively against the model's action requests)
    fn name(&self) -> &str;

    /// Human-readable description embedded into the agent's system prompt
    fn description(&self) -> &str;

    /// JSON Schema for the input payload
    fn input_schema(&self) -> Value;

    /// Execute the tool with the parsed input
    async fn invoke(&self, input: Value) -> ToolResult;
}

/// Result of a tool invocation
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result from a string
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Create a successful result from any serializable value
    pub fn from_value(value: &Value) -> Self {
        let content = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            content,
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::error(err.to_string())
    }
}
