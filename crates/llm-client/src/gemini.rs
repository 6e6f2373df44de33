use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_core::ProviderConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::client::LlmClient;
use crate::error::{LlmError, LlmResult};
use crate::rate_limit::ProviderRateLimiter;
use crate::types::{fold_system_into_first_user, ChatRequest, ChatResponse, Role};

/// Client for the Gemini `generateContent` API.
pub struct GeminiClient {
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
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GeminiClient {
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
        let (system, turns) = if self.system_role {
            let system: Vec<&str> = request
                .messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.as_str())
                .collect();
            let turns: Vec<_> = request
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned()
                .collect();
            (system.join("\n\n"), turns)
        } else {
            (String::new(), fold_system_into_first_user(&request.messages))
        };

        let contents: Vec<serde_json::Value> = turns
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation = json!({ "temperature": request.temperature });
        if let Some(max_tokens) = request.max_tokens {
            generation["maxOutputTokens"] = json!(max_tokens);
        }
        if request.json_mode {
            generation["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation,
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), body));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let content: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::EmptyContent);
        }

        let (tokens_in, tokens_out) = parsed
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
            .unwrap_or((0, 0));

        tracing::debug!(provider = %self.provider_id, tokens_in, tokens_out, "gemini completion");

        Ok(ChatResponse {
            content,
            model: parsed.model_version.unwrap_or_else(|| self.model.clone()),
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
