//! In-memory client with canned replies, for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::LlmClient;
use crate::error::{LlmError, LlmResult};
use crate::types::{ChatRequest, ChatResponse};

type Responder = Box<dyn Fn(&ChatRequest) -> LlmResult<String> + Send + Sync>;

/// Replies from a queue first, then from an optional responder closure.
/// Every request is recorded.
pub struct ScriptedClient {
    provider_id: String,
    model: String,
    lite: bool,
    queue: Mutex<VecDeque<LlmResult<String>>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            model: format!("{}-model", provider_id),
            lite: false,
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn lite(mut self) -> Self {
        self.lite = true;
        self
    }

    pub fn then_ok(self, content: impl Into<String>) -> Self {
        self.push(Ok(content.into()));
        self
    }

    pub fn then_err(self, err: LlmError) -> Self {
        self.push(Err(err));
        self
    }

    pub fn respond_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChatRequest) -> LlmResult<String> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// Always answer with `content`.
    pub fn repeating(provider_id: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        Self::new(provider_id).respond_with(move |_| Ok(content.clone()))
    }

    fn push(&self, item: LlmResult<String>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(item);
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        let content = match (next, &self.responder) {
            (Some(item), _) => item?,
            (None, Some(f)) => f(request)?,
            (None, None) => {
                return Err(LlmError::InvalidResponse("script exhausted".to_string()))
            }
        };
        Ok(ChatResponse {
            tokens_in: request.messages.iter().map(|m| m.content.chars().count() as u64).sum(),
            tokens_out: content.chars().count() as u64,
            content,
            model: self.model.clone(),
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
