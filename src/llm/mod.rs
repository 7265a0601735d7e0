//! LLM client module
//!
//! Provider-agnostic completion types, the `LlmClient` trait, a scripted
//! mock for deterministic tests, and an OpenAI-compatible HTTP client.

mod client;
mod error;
mod openai;
mod types;

pub use client::LlmClient;
pub use client::mock;
pub use error::LlmError;
pub use openai::OpenAiClient;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, Role, TokenUsage, model_pricing, usage_cost_usd,
};
