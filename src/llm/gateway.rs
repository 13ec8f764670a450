//! LLM gateway: the single `generate(system, user)` operation the tutor uses.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Thin wrapper over an `LlmProvider` with a fixed max output token count.
///
/// Every call is a fresh generation: there is no retry, no caching and no
/// partial result on failure.
#[derive(Clone)]
pub struct LlmGateway {
    llm: Arc<dyn LlmProvider>,
    max_tokens: u32,
}

impl LlmGateway {
    pub fn new(llm: Arc<dyn LlmProvider>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    /// Generate text for `user_content` under `system_instruction`.
    pub async fn generate(
        &self,
        system_instruction: &str,
        user_content: &str,
    ) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system_instruction),
            ChatMessage::user(user_content),
        ])
        .with_max_tokens(self.max_tokens);

        debug!(
            model = self.llm.model_name(),
            input_chars = user_content.chars().count(),
            "Sending generation request"
        );

        let started = Instant::now();
        match self.llm.complete(request).await {
            Ok(response) => {
                info!(
                    model = self.llm.model_name(),
                    input_tokens = response.input_tokens,
                    output_tokens = response.output_tokens,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Generation complete"
                );
                Ok(response.content)
            }
            Err(e) => {
                warn!(
                    model = self.llm.model_name(),
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Generation failed"
                );
                Err(e)
            }
        }
    }
}
