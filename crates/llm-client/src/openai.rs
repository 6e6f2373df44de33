use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pipeline_core::ProviderConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::client::LlmClient;
use crate::error::{LlmError, LlmResult};
use crate::rate_limit::ProviderRateLimiter;
use crate::types::{fold_system_into_first_user, ChatRequest, ChatResponse};

/// Client for any `/chat/completions` endpoint speaking the OpenAI dialect.
pub struct OpenAiCompatibleClient {
    client: Client,
    provider_id: String,
    base_url: String,
    api_key: String,
    model: String,
    system_role: bool,
    lite: bool,
    limiter: Option<Arc<ProviderRateLimiter>>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &ProviderConfig, limiter: Option<Arc<ProviderRateLimiter>>) -> LlmResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey(config.id.clone()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            provider_id: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            system_role: config.system_role,
            lite: config.lite,
            limiter,
        })
    }

    fn body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages = if self.system_role {
            request.messages.clone()
        } else {
            fold_system_into_first_user(&request.messages)
        };
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = format!("{}/chat/completions", self.base_url);
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), body));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyContent)?;
        let (tokens_in, tokens_out) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        tracing::debug!(
            provider = %self.provider_id,
            model = %self.model,
            tokens_in,
            tokens_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat completion"
        );

        Ok(ChatResponse {
            content,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            tokens_in,
            tokens_out,
        })
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn is_lite(&self) -> bool {
        self.lite
    }
}
