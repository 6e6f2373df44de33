use async_trait::async_trait;

use crate::error::LlmResult;
use crate::types::{ChatRequest, ChatResponse};

/// Chat-completion transport for one configured provider.
///
/// Implemented by the OpenAI-compatible and Gemini HTTP clients, and by the
/// scripted fake used in tests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse>;

    fn provider_id(&self) -> &str;

    fn model(&self) -> &str;

    /// Lite providers are good at short classification, not long reasoning.
    fn is_lite(&self) -> bool {
        false
    }
}
