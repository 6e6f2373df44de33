use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::client::LlmClient;
use crate::error::{LlmError, LlmResult};
use crate::types::{ChatRequest, ChatResponse};

/// Delay before the second attempt; doubles after each failure.
pub const BASE_DELAY_MS: u64 = 500;

/// Backoff schedule for `attempts` total tries (so `attempts - 1` delays).
pub fn backoff(attempts: usize) -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(BASE_DELAY_MS / 2)
        .max_delay(std::time::Duration::from_secs(10))
        .map(jitter)
        .take(attempts.saturating_sub(1))
}

/// Send `request`, retrying transient failures with exponential backoff.
pub async fn chat_with_retry(
    client: &dyn LlmClient,
    request: &ChatRequest,
    attempts: usize,
) -> LlmResult<ChatResponse> {
    RetryIf::spawn(
        backoff(attempts),
        move || async move {
            client.chat(request).await.map_err(|e| {
                if e.is_transient() {
                    tracing::warn!(provider = client.provider_id(), "retryable LLM error: {}", e);
                }
                e
            })
        },
        |e: &LlmError| e.is_transient(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedClient;
    use crate::types::ChatMessage;

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let client = ScriptedClient::new("p")
            .then_err(LlmError::RateLimited(429))
            .then_ok("done");
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        let response = chat_with_retry(&client, &request, 3).await.unwrap();
        assert_eq!(response.content, "done");
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let client = ScriptedClient::new("p")
            .then_err(LlmError::Unauthorized(401))
            .then_ok("never");
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        assert!(chat_with_retry(&client, &request, 3).await.is_err());
        assert_eq!(client.call_count(), 1);
    }

    #[test]
    fn backoff_length() {
        assert_eq!(backoff(3).count(), 2);
        assert_eq!(backoff(1).count(), 0);
    }
}
