//! Tool error types and well-known error-code prefixes

use thiserror::Error;

/// Prefix for tool invocations that fail or name an unknown tool
pub const ERROR_TOOL_INVOCATION: &str = "ERROR_TOOL_INVOCATION";

/// Prefix for LLM output the iteration loop could not classify
pub const ERROR_LLM_PARSE: &str = "ERROR_LLM_PARSE";

/// Prefix recorded when a task exhausts its iteration budget
pub const ERROR_MAX_ITERATIONS: &str = "ERROR_MAX_ITERATIONS";

/// Prefix for fetch-style tools invoked without a URL
pub const ERROR_MISSING_URL: &str = "ERROR_MISSING_URL";

/// Prefix for search-style tools invoked without a query
pub const ERROR_MISSING_QUERY: &str = "ERROR_MISSING_QUERY";

/// Errors that can occur during tool execution
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{ERROR_TOOL_INVOCATION}: unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("{ERROR_MISSING_URL}: tool '{tool}' requires a url input")]
    MissingUrl { tool: String },

    #[error("{ERROR_MISSING_QUERY}: tool '{tool}' requires a query input")]
    MissingQuery { tool: String },

    #[error("Invalid input for tool '{tool}': {message}")]
    InvalidInput { tool: String, message: String },

    #[error("Tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}
