//! LlmClient trait definition

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LlmError};

/// Stateless LLM client - each call is independent
///
/// This is the core abstraction for interacting with language models. The
/// iteration loop threads the full conversation through every request, so
/// implementations hold no per-conversation state and a single client can
/// back any number of agents.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier, recorded in logs for per-model usage accounting
    fn model(&self) -> &str;

    /// Send a single completion request (blocking until complete)
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

pub mod mock {
    //! Scripted LLM double for deterministic tests
    //!
    //! Always compiled (not test-gated) so downstream crates and this
    //! crate's integration suite can drive full workflows without a
    //! provider key.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::debug;

    use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};

    /// Mock LLM client replaying a scripted sequence of replies
    ///
    /// Once the script is exhausted the client returns the repeating
    /// fallback if one was set, otherwise a fatal `InvalidResponse`.
    pub struct MockLlmClient {
        script: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
        fallback: Option<CompletionResponse>,
        delay: Option<Duration>,
        call_count: AtomicUsize,
        model: String,
    }

    impl MockLlmClient {
        /// Client with no scripted replies (every call fails)
        pub fn empty() -> Self {
            Self::from_results(vec![])
        }

        /// Client replying with the given contents in order
        pub fn new<I, S>(contents: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self::from_results(
                contents
                    .into_iter()
                    .map(|c| Ok(CompletionResponse::text(c)))
                    .collect(),
            )
        }

        /// Client replying with the given results (responses or errors) in order
        pub fn from_results(results: Vec<Result<CompletionResponse, LlmError>>) -> Self {
            Self {
                script: Mutex::new(results.into()),
                fallback: None,
                delay: None,
                call_count: AtomicUsize::new(0),
                model: "mock-model".to_string(),
            }
        }

        /// Client that always replies with the same content
        pub fn always(content: impl Into<String>) -> Self {
            let mut client = Self::from_results(vec![]);
            client.fallback = Some(CompletionResponse::text(content));
            client
        }

        /// Builder method to set the repeating fallback used after the script runs out
        pub fn with_fallback(mut self, content: impl Into<String>) -> Self {
            self.fallback = Some(CompletionResponse::text(content));
            self
        }

        /// Builder method to delay every reply (for concurrency-window tests)
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Builder method to set the reported model name
        pub fn with_model(mut self, model: impl Into<String>) -> Self {
            self.model = model.into();
            self
        }

        /// Builder method to attach synthetic token usage to every scripted reply
        pub fn with_usage(self, input_tokens: u64, output_tokens: u64) -> Self {
            let usage = TokenUsage::new(input_tokens, output_tokens);
            {
                let mut script = self.script.lock().expect("mock script lock");
                for entry in script.iter_mut() {
                    if let Ok(resp) = entry {
                        resp.usage = usage;
                    }
                }
            }
            let mut this = self;
            if let Some(fallback) = this.fallback.as_mut() {
                fallback.usage = usage;
            }
            this
        }

        /// Number of completed calls so far
        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        fn model(&self) -> &str {
            &self.model
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            debug!(call = idx, "MockLlmClient::complete");

            let next = self.script.lock().expect("mock script lock").pop_front();
            match next {
                Some(result) => result,
                None => match &self.fallback {
                    Some(resp) => Ok(resp.clone()),
                    None => Err(LlmError::InvalidResponse("Mock script exhausted".to_string())),
                },
            }
        }
    }

}
