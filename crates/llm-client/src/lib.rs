//! Chat-completion clients for the LLM providers the pipeline talks to,
//! with per-provider rate limiting and transient-error retries.

pub mod client;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod rate_limit;
pub mod registry;
pub mod retry;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod types;

pub use client::LlmClient;
pub use error::{LlmError, LlmResult};
pub use gemini::GeminiClient;
pub use openai::OpenAiCompatibleClient;
pub use rate_limit::ProviderRateLimiter;
pub use registry::ProviderRegistry;
pub use retry::chat_with_retry;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedClient;
pub use types::{fold_system_into_first_user, ChatMessage, ChatRequest, ChatResponse, Role};
